//! In-memory devices for exercising the engines and the session without
//! hardware.

#![allow(missing_docs, dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_possible_truncation)]

use {
    crate::{
        error::{Error, Result, TransportError},
        protocol::{
            firehose::{self, ENVELOPE_HEADER_LEN},
            sahara::{Mode, Packet},
        },
        transport::Transport,
    },
    std::{
        collections::{HashMap, VecDeque},
        time::Duration,
    },
    xmltree::{Element, XMLNode},
};

/// Send library logs to the test harness; `RUST_LOG=trace` shows frames.
pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

fn pop_into(queue: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let n = buf.len().min(queue.len());
    for b in buf.iter_mut().take(n) {
        *b = queue.pop_front().unwrap();
    }
    n
}

fn timed_out(timeout: Duration) -> Error {
    TransportError::Timeout(timeout.as_millis()).into()
}

/// Canned inbound bytes; records every send.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    rx: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    pub fn push_frame(&mut self, packet: &Packet) {
        self.push_bytes(&packet.encode());
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.sent.push(data.to_vec());
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.rx.is_empty() {
            return Err(timed_out(timeout));
        }
        Ok(pop_into(&mut self.rx, buf))
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn max_transfer_unit(&self) -> usize {
        usize::MAX
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_present(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaharaPhase {
    Greeting,
    Command,
    AwaitData { len: usize },
    AwaitDone,
    Finished,
}

/// Boot ROM that serves identity queries and pulls an image in fixed slices.
#[derive(Debug)]
pub struct SaharaDevice {
    out: VecDeque<u8>,
    phase: SaharaPhase,
    image_len: usize,
    slice: usize,
    next_offset: usize,
    received: Vec<u8>,
    data_sends: usize,
    unsolicited: usize,
    end_status: u32,
    identity: HashMap<u32, Vec<u8>>,
    reset: bool,
    handed_off: bool,
    hello_modes: Vec<Mode>,
    disconnect_after: Option<usize>,
    disconnected: bool,
}

impl SaharaDevice {
    /// Device expecting an image of `image_len` bytes, requested `slice`
    /// bytes at a time.
    pub fn new(image_len: usize, slice: usize) -> Self {
        let mut device = Self {
            out: VecDeque::new(),
            phase: SaharaPhase::Greeting,
            image_len,
            slice,
            next_offset: 0,
            received: Vec::new(),
            data_sends: 0,
            unsolicited: 0,
            end_status: 0,
            identity: HashMap::new(),
            reset: false,
            handed_off: false,
            hello_modes: Vec::new(),
            disconnect_after: None,
            disconnected: false,
        };
        device.hello(Mode::ImageTransferPending);
        device
    }

    pub fn with_identity(mut self, serial: u32, hw_id: u64, pk_hash: Vec<u8>, version: u32) -> Self {
        self.identity
            .insert(1, serial.to_le_bytes().to_vec());
        self.identity
            .insert(2, hw_id.to_le_bytes().to_vec());
        self.identity.insert(3, pk_hash);
        self.identity
            .insert(7, version.to_le_bytes().to_vec());
        self
    }

    pub fn with_end_status(mut self, status: u32) -> Self {
        self.end_status = status;
        self
    }

    /// Drop off the bus after this many image slices.
    pub fn with_disconnect_after(mut self, slices: usize) -> Self {
        self.disconnect_after = Some(slices);
        self
    }

    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn data_sends(&self) -> usize {
        self.data_sends
    }

    pub fn unsolicited_sends(&self) -> usize {
        self.unsolicited
    }

    pub fn was_reset(&self) -> bool {
        self.reset
    }

    pub fn handed_off(&self) -> bool {
        self.handed_off
    }

    /// Modes requested by every `HelloResponse` so far.
    pub fn hello_modes(&self) -> &[Mode] {
        &self.hello_modes
    }

    fn queue(&mut self, packet: &Packet) {
        self.out
            .extend(packet.encode());
    }

    fn hello(&mut self, mode: Mode) {
        self.queue(&Packet::Hello {
            version: 2,
            version_compatible: 1,
            max_command_len: 0x400,
            mode,
        });
    }

    fn request_next(&mut self) {
        if self.next_offset >= self.image_len {
            self.queue(&Packet::EndOfImage {
                image_id: 13,
                status: self.end_status,
            });
            self.phase = SaharaPhase::AwaitDone;
            return;
        }
        let len = self
            .slice
            .min(self.image_len - self.next_offset);
        self.queue(&Packet::ReadData {
            image_id: 13,
            offset: self.next_offset as u64,
            length: len as u64,
            wide: false,
        });
        self.phase = SaharaPhase::AwaitData { len };
    }

    fn handle(&mut self, packet: Packet) {
        match packet {
            Packet::HelloResponse { mode, .. } => {
                self.hello_modes.push(mode);
                if mode == Mode::Command {
                    self.queue(&Packet::CommandReady);
                    self.phase = SaharaPhase::Command;
                } else {
                    self.request_next();
                }
            },
            Packet::Execute { command } => {
                let len = self
                    .identity
                    .get(&command)
                    .map_or(0, Vec::len);
                self.queue(&Packet::ExecuteResponse {
                    command,
                    data_len: len as u32,
                });
            },
            Packet::ExecuteData { command } => {
                let data = self
                    .identity
                    .get(&command)
                    .cloned()
                    .unwrap_or_default();
                self.out.extend(data);
            },
            Packet::SwitchMode { mode } => {
                self.phase = SaharaPhase::Greeting;
                self.hello(mode);
            },
            Packet::Done => {
                self.queue(&Packet::DoneResponse { image_tx_status: 1 });
                self.phase = SaharaPhase::Finished;
                self.handed_off = true;
            },
            Packet::Reset => {
                self.queue(&Packet::ResetResponse);
                self.reset = true;
            },
            _ => self.unsolicited += 1,
        }
    }
}

impl Transport for SaharaDevice {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.disconnected {
            return Err(TransportError::Disconnected.into());
        }

        if let SaharaPhase::AwaitData { len } = self.phase {
            assert_eq!(data.len(), len, "slice length differs from the request");
            self.received
                .extend_from_slice(data);
            self.data_sends += 1;
            self.next_offset += len;
            if self.disconnect_after == Some(self.data_sends) {
                self.disconnected = true;
                return Ok(data.len());
            }
            self.request_next();
            return Ok(data.len());
        }

        match Packet::decode(data) {
            Ok(packet) => self.handle(packet),
            Err(_) => self.unsolicited += 1,
        }
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.disconnected {
            return Err(TransportError::Disconnected.into());
        }
        if self.out.is_empty() {
            return Err(timed_out(timeout));
        }
        Ok(pop_into(&mut self.out, buf))
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "sim-bootrom"
    }

    fn max_transfer_unit(&self) -> usize {
        usize::MAX
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_present(&self) -> bool {
        !self.disconnected && !self.handed_off
    }
}

/// Failure injected into the loader's next answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next response document is cut in half.
    TruncatedXml,
    /// The next envelope announces more bytes than it carries.
    OverstatedEnvelope,
    /// The next read delivers this many bytes too few and then goes silent.
    ShortRead(usize),
}

/// One request as the loader saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn number(&self, name: &str) -> u64 {
        self.attr(name)
            .and_then(firehose::parse_number)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    lun: u32,
    offset: usize,
    remaining: usize,
}

/// Loader with in-memory storage per physical partition.
#[derive(Debug)]
pub struct FirehoseDevice {
    out: VecDeque<u8>,
    inbound: Vec<u8>,
    sector_size: usize,
    disk_sectors: u64,
    storage: HashMap<u32, Vec<u8>>,
    max_payload: usize,
    nak_oversized: bool,
    nak_program_at: Vec<u64>,
    nak_bootable: bool,
    writing: Option<PendingWrite>,
    largest_raw: usize,
    requests: Vec<RecordedRequest>,
    fault: Option<Fault>,
    bootable: Option<u32>,
    storage_drives: Option<[u64; 4]>,
    powered_off: bool,
}

impl FirehoseDevice {
    pub fn new(sector_size: usize, disk_sectors: u64) -> Self {
        Self {
            out: VecDeque::new(),
            inbound: Vec::new(),
            sector_size,
            disk_sectors,
            storage: HashMap::new(),
            max_payload: 1024 * 1024,
            nak_oversized: false,
            nak_program_at: Vec::new(),
            nak_bootable: false,
            writing: None,
            largest_raw: 0,
            requests: Vec::new(),
            fault: None,
            bootable: None,
            storage_drives: None,
            powered_off: false,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Refuse oversized `configure` with a NAK naming the supported size.
    pub fn with_nak_oversized_configure(mut self, nak: bool) -> Self {
        self.nak_oversized = nak;
        self
    }

    /// Refuse `program` requests starting at this sector.
    pub fn with_nak_program_at(mut self, sector: u64) -> Self {
        self.nak_program_at.push(sector);
        self
    }

    pub fn with_nak_set_bootable(mut self, nak: bool) -> Self {
        self.nak_bootable = nak;
        self
    }

    pub fn inject(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    pub fn requests(&self) -> &[RecordedRequest] {
        &self.requests
    }

    pub fn requests_named(&self, tag: &str) -> Vec<&RecordedRequest> {
        self.requests
            .iter()
            .filter(|r| r.tag == tag)
            .collect()
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    pub fn largest_raw_send(&self) -> usize {
        self.largest_raw
    }

    pub fn bootable(&self) -> Option<u32> {
        self.bootable
    }

    pub fn storage_drives(&self) -> Option<[u64; 4]> {
        self.storage_drives
    }

    pub fn powered_off(&self) -> bool {
        self.powered_off
    }

    /// Direct access to a LUN's bytes.
    pub fn disk(&mut self, lun: u32) -> &mut Vec<u8> {
        let size = self.disk_sectors as usize * self.sector_size;
        self.storage
            .entry(lun)
            .or_insert_with(|| vec![0u8; size])
    }

    fn envelope(&mut self, document: Vec<u8>) {
        let mut document = document;
        let mut declared = document.len();
        match self.fault {
            Some(Fault::TruncatedXml) => {
                document.truncate(document.len() / 2);
                declared = document.len();
                self.fault = None;
            },
            Some(Fault::OverstatedEnvelope) => {
                declared += 64;
                self.fault = None;
            },
            _ => {},
        }
        self.out
            .extend((declared as u32).to_le_bytes());
        self.out
            .extend(firehose::ENVELOPE_VERSION.to_le_bytes());
        self.out
            .extend(0u32.to_le_bytes());
        self.out.extend(document);
    }

    fn document(children: Vec<Element>) -> Vec<u8> {
        let mut root = Element::new("data");
        for child in children {
            root.children
                .push(XMLNode::Element(child));
        }
        let mut buf = Vec::new();
        root.write(&mut buf)
            .unwrap();
        buf
    }

    fn log(&mut self, line: &str) {
        let mut e = Element::new("log");
        e.attributes
            .insert("value".into(), line.into());
        let doc = Self::document(vec![e]);
        self.envelope(doc);
    }

    fn respond(&mut self, ack: bool, raw: bool, extra: &[(&str, String)]) {
        let mut e = Element::new("response");
        e.attributes.insert(
            "value".into(),
            if ack { "ACK" } else { "NAK" }.into(),
        );
        for (k, v) in extra {
            e.attributes
                .insert((*k).to_string(), v.clone());
        }
        e.attributes.insert(
            "rawmode".into(),
            if raw { "true" } else { "false" }.into(),
        );
        let doc = Self::document(vec![e]);
        self.envelope(doc);
    }

    fn range_bytes(&self, req: &RecordedRequest) -> (u32, usize, usize) {
        let ss = req.number("SECTOR_SIZE_IN_BYTES") as usize;
        let lun = req.number("physical_partition_number") as u32;
        let start = req.number("start_sector") as usize * ss;
        let len = req.number("num_partition_sectors") as usize * ss;
        (lun, start, len)
    }

    fn resolve_sector(&self, expr: &str) -> Option<u64> {
        if let Some(n) = firehose::parse_number(expr) {
            return Some(n);
        }
        let rest = expr
            .trim()
            .trim_end_matches('.')
            .strip_prefix("NUM_DISK_SECTORS-")?;
        Some(self.disk_sectors - rest.parse::<u64>().ok()?)
    }

    fn handle(&mut self, req: RecordedRequest) {
        match req.tag.as_str() {
            "configure" => {
                self.log("INFO: Calling handler for configure");
                let requested = req.number("MaxPayloadSizeToTargetInBytes") as usize;
                if self.nak_oversized && requested > self.max_payload {
                    self.respond(
                        false,
                        false,
                        &[(
                            "MaxPayloadSizeToTargetInBytesSupported",
                            self.max_payload.to_string(),
                        )],
                    );
                } else {
                    self.respond(
                        true,
                        false,
                        &[
                            (
                                "MaxPayloadSizeToTargetInBytes",
                                requested.min(self.max_payload).to_string(),
                            ),
                            ("MaxXMLSizeInBytes", "4096".into()),
                        ],
                    );
                }
            },
            "program" => {
                let start = req.number("start_sector");
                if self.nak_program_at.contains(&start) {
                    self.log("ERROR: write protected region");
                    self.respond(false, false, &[]);
                    return;
                }
                let (lun, offset, remaining) = self.range_bytes(&req);
                self.disk(lun);
                self.writing = Some(PendingWrite {
                    lun,
                    offset,
                    remaining,
                });
                self.respond(true, true, &[]);
            },
            "read" => {
                let (lun, offset, len) = self.range_bytes(&req);
                self.respond(true, true, &[]);
                let mut data = self.disk(lun)[offset..offset + len].to_vec();
                if let Some(Fault::ShortRead(missing)) = self.fault.take() {
                    data.truncate(len.saturating_sub(missing));
                    self.out.extend(data);
                    return;
                }
                self.out.extend(data);
                self.respond(true, false, &[]);
            },
            "erase" => {
                let (lun, offset, len) = self.range_bytes(&req);
                self.disk(lun)[offset..offset + len].fill(0);
                self.respond(true, false, &[]);
            },
            "getstorageinfo" => {
                let line = format!(
                    "INFO: {{\"storage_info\": {{\"total_blocks\":{}, \"block_size\":{}, \
                     \"page_size\":{}, \"num_physical\":1, \"mem_type\":\"sim\", \
                     \"prod_name\":\"SIM\"}}}}",
                    self.disk_sectors, self.sector_size, self.sector_size
                );
                self.log(&line);
                self.respond(true, false, &[]);
            },
            "setbootablestoragedrive" => {
                if self.nak_bootable {
                    self.respond(false, false, &[]);
                } else {
                    self.bootable = Some(req.number("value") as u32);
                    self.respond(true, false, &[]);
                }
            },
            "power" => {
                self.respond(true, false, &[]);
                self.powered_off = true;
            },
            "peek" => {
                let address = req.number("address64");
                let size = req.number("SizeInBytes");
                let bytes: Vec<String> = (0..size)
                    .map(|i| format!("{:02X}", (address + i) as u8))
                    .collect();
                self.log(&format!("0x{address:08X}: {}", bytes.join(" ")));
                self.respond(true, false, &[]);
            },
            "patch" => {
                let sector = req
                    .attr("start_sector")
                    .and_then(|s| self.resolve_sector(s));
                let value = req
                    .attr("value")
                    .and_then(firehose::parse_number);
                if let (Some(sector), Some(value)) = (sector, value) {
                    let ss = req.number("SECTOR_SIZE_IN_BYTES") as usize;
                    let lun = req.number("physical_partition_number") as u32;
                    let at = sector as usize * ss + req.number("byte_offset") as usize;
                    let size = req.number("size_in_bytes") as usize;
                    self.disk(lun)[at..at + size].copy_from_slice(&value.to_le_bytes()[..size]);
                }
                self.respond(true, false, &[]);
            },
            "nop" => self.respond(true, false, &[]),
            "createstoragedrives" => {
                self.storage_drives = Some([
                    req.number("DRIVE4_SIZE_IN_KB"),
                    req.number("DRIVE5_SIZE_IN_KB"),
                    req.number("DRIVE6_SIZE_IN_KB"),
                    req.number("DRIVE7_SIZE_IN_KB"),
                ]);
                self.respond(true, false, &[]);
            },
            _ => self.respond(false, false, &[]),
        }
    }

    fn consume_raw(&mut self, data: &[u8]) {
        let Some(mut write) = self.writing else {
            return;
        };
        assert!(
            data.len() <= write.remaining,
            "host sent past the end of the program range"
        );
        self.largest_raw = self.largest_raw.max(data.len());
        let at = write.offset;
        self.disk(write.lun)[at..at + data.len()].copy_from_slice(data);
        write.offset += data.len();
        write.remaining -= data.len();
        if write.remaining == 0 {
            self.writing = None;
            self.respond(true, false, &[]);
        } else {
            self.writing = Some(write);
        }
    }

    fn consume_xml(&mut self, data: &[u8]) {
        self.inbound
            .extend_from_slice(data);
        while self.inbound.len() >= ENVELOPE_HEADER_LEN {
            let len = u32::from_le_bytes(self.inbound[..4].try_into().unwrap()) as usize;
            if self.inbound.len() < ENVELOPE_HEADER_LEN + len {
                return;
            }
            let doc: Vec<u8> = self
                .inbound
                .drain(..ENVELOPE_HEADER_LEN + len)
                .skip(ENVELOPE_HEADER_LEN)
                .collect();
            let root = Element::parse(doc.as_slice()).unwrap();
            for node in root.children {
                if let XMLNode::Element(e) = node {
                    let req = RecordedRequest {
                        tag: e.name.clone(),
                        attributes: e
                            .attributes
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    };
                    self.requests.push(req.clone());
                    self.handle(req);
                }
            }
        }
    }
}

impl Transport for FirehoseDevice {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.powered_off {
            return Err(TransportError::Disconnected.into());
        }
        if self.writing.is_some() {
            self.consume_raw(data);
        } else {
            self.consume_xml(data);
        }
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.out.is_empty() {
            if self.powered_off {
                return Err(TransportError::Disconnected.into());
            }
            return Err(timed_out(timeout));
        }
        Ok(pop_into(&mut self.out, buf))
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "sim-loader"
    }

    fn max_transfer_unit(&self) -> usize {
        usize::MAX
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_present(&self) -> bool {
        !self.powered_off
    }
}

/// A device that starts in the boot ROM and re-enumerates as the loader
/// after the handoff.
#[derive(Debug)]
pub struct EdlDevice {
    pub bootrom: SaharaDevice,
    pub loader: FirehoseDevice,
    in_loader: bool,
    reopens: usize,
}

impl EdlDevice {
    pub fn new(bootrom: SaharaDevice, loader: FirehoseDevice) -> Self {
        Self {
            bootrom,
            loader,
            in_loader: false,
            reopens: 0,
        }
    }

    /// A device whose loader is already running.
    pub fn already_in_loader(loader: FirehoseDevice) -> Self {
        let mut bootrom = SaharaDevice::new(0, 1);
        bootrom.out.clear();
        Self {
            bootrom,
            loader,
            in_loader: true,
            reopens: 0,
        }
    }

    pub fn in_loader(&self) -> bool {
        self.in_loader
    }

    pub fn reopens(&self) -> usize {
        self.reopens
    }
}

impl Transport for EdlDevice {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.in_loader {
            self.loader.send(data)
        } else {
            self.bootrom.send(data)
        }
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.in_loader {
            self.loader.receive(buf, timeout)
        } else {
            self.bootrom.receive(buf, timeout)
        }
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "sim-edl"
    }

    fn max_transfer_unit(&self) -> usize {
        usize::MAX
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.reopens += 1;
        if self.bootrom.handed_off() {
            self.in_loader = true;
        }
        Ok(())
    }

    fn is_present(&self) -> bool {
        if self.in_loader {
            self.loader.is_present()
        } else {
            self.bootrom.is_present()
        }
    }
}
