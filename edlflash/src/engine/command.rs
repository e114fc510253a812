//! XML command protocol spoken to the uploaded loader.
//!
//! ```text
//! Disconnected -> Negotiating -> Ready -> {Reading, Writing, Configuring} -> Ready
//! ```
//!
//! Every request is answered by any number of `<log>` elements and exactly
//! one terminal `<response>`. Nothing else is sent until that response has
//! been consumed. A session-fatal failure drops the engine back to
//! `Disconnected`; a refused request returns it to `Ready`.

use {
    crate::{
        error::{Error, ProtocolError, Result},
        image::source::ImageSource,
        protocol::firehose::{
            self, ConfigureParams, Message, PatchParams, PowerAction, Request, Response,
            SectorRange,
        },
        session::config::SessionConfig,
        transport::Transport,
    },
    log::{debug, info, warn},
    std::{fmt, io::Write, time::Duration},
};

/// Command engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// No negotiated session.
    Disconnected,
    /// `configure` in flight.
    Negotiating,
    /// Idle and negotiated.
    Ready,
    /// Streaming sectors from the device.
    Reading,
    /// Streaming sectors to the device.
    Writing,
    /// An auxiliary request is in flight.
    Configuring,
}

impl CommandState {
    /// Short state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Negotiating => "Negotiating",
            Self::Ready => "Ready",
            Self::Reading => "Reading",
            Self::Writing => "Writing",
            Self::Configuring => "Configuring",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer parameters agreed with the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Negotiated {
    /// Largest raw chunk, a whole number of sectors.
    pub max_payload: usize,
    /// Largest XML document either side may send.
    pub max_xml: usize,
    /// Sector size used for every storage request.
    pub sector_size: usize,
}

/// Storage description reported by `getstorageinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StorageInfo {
    /// Physical partition described.
    pub partition: u32,
    /// Raw log lines from the loader.
    pub lines: Vec<String>,
}

impl StorageInfo {
    /// Find `key` in the log lines, in either `key=value` or `"key": value`
    /// form.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<String> {
        for line in &self.lines {
            let mut rest = line.as_str();
            while let Some(pos) = rest.find(key) {
                let after = &rest[pos + key.len()..];
                let after = after.trim_start_matches('"').trim_start();
                if let Some(value) = after
                    .strip_prefix(':')
                    .or_else(|| after.strip_prefix('='))
                {
                    let value = value
                        .trim_start()
                        .trim_start_matches('"');
                    let end = value
                        .find(['"', ',', '}', ' '])
                        .unwrap_or(value.len());
                    if end > 0 {
                        return Some(value[..end].to_string());
                    }
                }
                rest = &rest[pos + key.len()..];
            }
        }
        None
    }

    /// Number of sectors on the partition, if reported.
    #[must_use]
    pub fn total_blocks(&self) -> Option<u64> {
        self.field("total_blocks")
            .and_then(|v| firehose::parse_number(&v))
    }

    /// Block size in bytes, if reported.
    #[must_use]
    pub fn block_size(&self) -> Option<u64> {
        self.field("block_size")
            .and_then(|v| firehose::parse_number(&v))
    }
}

/// Command protocol state machine.
#[derive(Debug)]
pub struct CommandEngine {
    state: CommandState,
    negotiated: Option<Negotiated>,
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandEngine {
    /// Engine with no negotiated session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CommandState::Disconnected,
            negotiated: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Parameters from the last successful `configure`.
    #[must_use]
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    fn invalid(&self, operation: &'static str) -> Error {
        ProtocolError::InvalidState {
            state: self.state.as_str(),
            operation,
        }
        .into()
    }

    fn begin(&mut self, next: CommandState, operation: &'static str) -> Result<Negotiated> {
        match (self.state, self.negotiated) {
            (CommandState::Ready, Some(negotiated)) => {
                self.state = next;
                Ok(negotiated)
            },
            _ => Err(self.invalid(operation)),
        }
    }

    /// Record a failure: session-fatal errors disconnect, the rest return to
    /// `Ready`.
    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal_to_session() {
            debug!("Command engine disconnected in {}: {err}", self.state);
            self.state = CommandState::Disconnected;
            self.negotiated = None;
        } else {
            self.state = CommandState::Ready;
        }
        err
    }

    /// The raw stream is out of step with the loader; nothing further can be
    /// interpreted until a fresh connection.
    fn desync(&mut self, err: Error) -> Error {
        debug!("Command engine lost sync in {}: {err}", self.state);
        self.state = CommandState::Disconnected;
        self.negotiated = None;
        err
    }

    fn max_xml(&self, config: &SessionConfig) -> usize {
        self.negotiated
            .map_or(config.max_xml_size, |n| n.max_xml)
    }

    /// Read documents until the terminal response, forwarding logs.
    fn await_response<T: Transport + ?Sized>(
        &self,
        io: &mut T,
        config: &SessionConfig,
        timeout: Duration,
    ) -> Result<(Response, Vec<String>)> {
        let max_xml = self.max_xml(config);
        let mut logs = Vec::new();
        loop {
            let document = firehose::read_document(io, timeout, max_xml)?;
            let mut response = None;
            for message in firehose::parse_document(&document)? {
                match message {
                    Message::Log(line) => {
                        info!("device: {line}");
                        logs.push(line);
                    },
                    Message::Response(r) if response.is_none() => response = Some(r),
                    Message::Response(_) => {
                        return Err(Error::malformed("two responses in one document"));
                    },
                }
            }
            if let Some(response) = response {
                return Ok((response, logs));
            }
        }
    }

    fn exchange<T: Transport + ?Sized>(
        &self,
        io: &mut T,
        config: &SessionConfig,
        request: &Request,
    ) -> Result<(Response, Vec<String>)> {
        debug!("-> <{}>", request.tag());
        firehose::write_request(io, request)?;
        let (response, logs) = self.await_response(io, config, config.timeouts.response)?;
        debug!("<- {:?} for <{}>", response.status, request.tag());
        Ok((response, logs))
    }

    /// Negotiate transfer parameters.
    ///
    /// A NAK that names a supported payload size, or a timeout, earns exactly
    /// one retry. The request always starts from the configured payload, so
    /// repeating the call yields the same result.
    pub fn configure<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
    ) -> Result<Negotiated> {
        if !matches!(self.state, CommandState::Disconnected | CommandState::Ready) {
            return Err(self.invalid("configure"));
        }
        self.state = CommandState::Negotiating;

        let sector_size = config.sector_size();
        let mut payload = config.max_payload;
        for attempt in 1..=2 {
            let request = Request::Configure(ConfigureParams {
                memory: config.memory,
                max_payload: payload,
                verbose: config.verbose,
                skip_write: config.skip_write,
                skip_storage_init: config.skip_storage_init,
                zlp_aware: config.zlp_aware,
            });

            let (response, _) = match self.exchange(io, config, &request) {
                Ok(reply) => reply,
                Err(e) if e.is_timeout() && attempt == 1 => {
                    warn!("configure timed out, retrying once");
                    let _ = io.clear_buffers();
                    continue;
                },
                Err(e) if e.is_timeout() => {
                    return Err(self.fail(
                        ProtocolError::NegotiationFailed(format!("no answer to configure: {e}"))
                            .into(),
                    ));
                },
                Err(e) => return Err(self.fail(e)),
            };

            if !response.is_ack() {
                let supported = response
                    .attr_number("MaxPayloadSizeToTargetInBytesSupported")
                    .map_err(|e| self.fail(e))?;
                match supported {
                    Some(supported) if attempt == 1 => {
                        #[allow(clippy::cast_possible_truncation)]
                        let supported = supported.min(usize::MAX as u64) as usize;
                        warn!("configure refused {payload} bytes, retrying with {supported}");
                        payload = payload.min(supported);
                        continue;
                    },
                    _ => {
                        return Err(self.fail(
                            ProtocolError::NegotiationFailed("configure was NAK'd".into()).into(),
                        ));
                    },
                }
            }

            let granted = response
                .attr_number("MaxPayloadSizeToTargetInBytes")
                .map_err(|e| self.fail(e))?;
            #[allow(clippy::cast_possible_truncation)]
            let granted = granted.map_or(payload, |g| payload.min(g.min(usize::MAX as u64) as usize));
            let max_payload = granted - granted % sector_size;
            if max_payload == 0 {
                return Err(self.fail(
                    ProtocolError::NegotiationFailed(format!(
                        "granted payload {granted} is smaller than one {sector_size}-byte sector"
                    ))
                    .into(),
                ));
            }

            let max_xml = response
                .attr_number("MaxXMLSizeInBytes")
                .map_err(|e| self.fail(e))?
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(config.max_xml_size);

            let negotiated = Negotiated {
                max_payload,
                max_xml,
                sector_size,
            };
            info!(
                "Negotiated {} bytes per chunk ({}-byte sectors, {})",
                max_payload, sector_size, config.memory
            );
            self.negotiated = Some(negotiated);
            self.state = CommandState::Ready;
            return Ok(negotiated);
        }

        Err(self.fail(
            ProtocolError::NegotiationFailed("configure failed after one retry".into()).into(),
        ))
    }

    /// Check that a loader is answering. Either status counts as alive.
    pub fn ping<T: Transport + ?Sized>(&mut self, io: &mut T, config: &SessionConfig) -> Result<()> {
        if !matches!(self.state, CommandState::Disconnected | CommandState::Ready) {
            return Err(self.invalid("ping"));
        }
        let (response, _) = self.exchange(io, config, &Request::Nop)?;
        debug!("nop answered with {:?}", response.status);
        Ok(())
    }

    /// Write `range` from `source`.
    ///
    /// The final chunk is zero-padded to the sector boundary. A NAK, or a
    /// source that cannot cover the range, fails with `WriteRejected`.
    pub fn program<T, S, F>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        range: SectorRange,
        partition: u32,
        source: &mut S,
        mut progress: F,
    ) -> Result<()>
    where
        T: Transport + ?Sized,
        S: ImageSource + ?Sized,
        F: FnMut(u64, u64),
    {
        let negotiated = self.begin(CommandState::Writing, "program")?;
        let sector_size = negotiated.sector_size;
        let total = range.byte_len(sector_size);

        let declared = source.total_len();
        if let Some(len) = declared.filter(|len| len.div_ceil(sector_size as u64) != range.count) {
            return Err(self.fail(
                ProtocolError::WriteRejected(format!(
                    "{len}-byte source does not fill {} sectors at {range}",
                    range.count
                ))
                .into(),
            ));
        }

        let request = Request::Program {
            sector_size,
            range,
            partition,
        };
        let (response, _) = self
            .exchange(io, config, &request)
            .map_err(|e| self.fail(e))?;
        if !response.is_ack() {
            return Err(self.fail(
                ProtocolError::WriteRejected(format!("program {range} on LUN {partition} NAK'd"))
                    .into(),
            ));
        }
        if !response.raw_mode {
            return Err(self.fail(Error::malformed("program ACK without rawmode")));
        }

        let shortfall = self
            .stream_out(io, negotiated, total, source, &mut progress)
            .map_err(|e| self.desync(e))?;

        let (response, _) = self
            .await_response(io, config, config.timeouts.data)
            .map_err(|e| self.fail(e))?;
        if !response.is_ack() {
            return Err(self.fail(
                ProtocolError::WriteRejected(format!("loader did not commit {range}")).into(),
            ));
        }
        if shortfall > 0 {
            return Err(self.fail(
                ProtocolError::WriteRejected(format!(
                    "source ended {shortfall} bytes before the end of {range}"
                ))
                .into(),
            ));
        }

        self.state = CommandState::Ready;
        debug!("Programmed {range} ({total} bytes)");
        Ok(())
    }

    /// Send `total` raw bytes; returns how many had to be zero-filled beyond
    /// the last sector the source covered.
    #[allow(clippy::cast_possible_truncation)] // chunk sizes are bounded by max_payload
    fn stream_out<T, S, F>(
        &self,
        io: &mut T,
        negotiated: Negotiated,
        total: u64,
        source: &mut S,
        progress: &mut F,
    ) -> Result<u64>
    where
        T: Transport + ?Sized,
        S: ImageSource + ?Sized,
        F: FnMut(u64, u64),
    {
        let sector_size = negotiated.sector_size;
        let mut sent = 0u64;
        let mut shortfall = 0u64;
        let mut exhausted = false;

        while sent < total {
            let want = (total - sent).min(negotiated.max_payload as u64) as usize;
            let mut chunk = if exhausted {
                Vec::new()
            } else {
                source.next_chunk(want)?
            };

            if chunk.len() < want {
                let padded = chunk
                    .len()
                    .next_multiple_of(sector_size)
                    .min(want);
                shortfall += (want - padded) as u64;
                exhausted = true;
                chunk.resize(want, 0);
            }

            io.send(&chunk)?;
            sent += chunk.len() as u64;
            progress(sent, total);
        }

        Ok(shortfall)
    }

    /// Read `range` into `sink`; returns the number of bytes delivered.
    pub fn read<T, W, F>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        range: SectorRange,
        partition: u32,
        sink: &mut W,
        mut progress: F,
    ) -> Result<u64>
    where
        T: Transport + ?Sized,
        W: Write + ?Sized,
        F: FnMut(u64, u64),
    {
        let negotiated = self.begin(CommandState::Reading, "read")?;
        let sector_size = negotiated.sector_size;
        let total = range.byte_len(sector_size);

        let request = Request::Read {
            sector_size,
            range,
            partition,
        };
        let (response, _) = self
            .exchange(io, config, &request)
            .map_err(|e| self.fail(e))?;
        if !response.is_ack() {
            return Err(self.fail(
                ProtocolError::Rejected(format!("read {range} on LUN {partition} NAK'd")).into(),
            ));
        }
        if !response.raw_mode {
            return Err(self.fail(Error::malformed("read ACK without rawmode")));
        }

        self.stream_in(io, config, negotiated, total, sink, &mut progress)
            .map_err(|e| self.desync(e))?;

        let (response, _) = self
            .await_response(io, config, config.timeouts.data)
            .map_err(|e| self.fail(e))?;
        if !response.is_ack() {
            return Err(self.fail(
                ProtocolError::Rejected(format!("loader reported failure reading {range}")).into(),
            ));
        }

        self.state = CommandState::Ready;
        debug!("Read {range} ({total} bytes)");
        Ok(total)
    }

    #[allow(clippy::cast_possible_truncation)] // chunk sizes are bounded by max_payload
    fn stream_in<T, W, F>(
        &self,
        io: &mut T,
        config: &SessionConfig,
        negotiated: Negotiated,
        total: u64,
        sink: &mut W,
        progress: &mut F,
    ) -> Result<()>
    where
        T: Transport + ?Sized,
        W: Write + ?Sized,
        F: FnMut(u64, u64),
    {
        let mut buf = vec![0u8; negotiated.max_payload.min(total as usize)];
        let mut received = 0u64;

        while received < total {
            let want = (total - received).min(buf.len() as u64) as usize;
            let got = firehose::receive_until_timeout(io, &mut buf[..want], config.timeouts.data)?;
            sink.write_all(&buf[..got])?;
            received += got as u64;
            progress(received, total);

            if got < want {
                return Err(ProtocolError::Truncated {
                    expected: total,
                    received,
                }
                .into());
            }
        }

        sink.flush()?;
        Ok(())
    }

    /// Run an auxiliary request; a NAK becomes `Rejected`.
    fn simple<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        request: &Request,
        operation: &'static str,
    ) -> Result<(Response, Vec<String>)> {
        self.begin(CommandState::Configuring, operation)?;
        let (response, logs) = self
            .exchange(io, config, request)
            .map_err(|e| self.fail(e))?;
        if !response.is_ack() {
            let detail = logs
                .last()
                .map(|l| format!(": {l}"))
                .unwrap_or_default();
            return Err(self.fail(
                ProtocolError::Rejected(format!("{operation} NAK'd{detail}")).into(),
            ));
        }
        self.state = CommandState::Ready;
        Ok((response, logs))
    }

    /// Erase `range`.
    pub fn erase<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        range: SectorRange,
        partition: u32,
    ) -> Result<()> {
        let sector_size = self
            .negotiated
            .map_or(config.sector_size(), |n| n.sector_size);
        self.simple(
            io,
            config,
            &Request::Erase {
                sector_size,
                range,
                partition,
            },
            "erase",
        )?;
        info!("Erased {range} on LUN {partition}");
        Ok(())
    }

    /// Describe a physical partition.
    pub fn storage_info<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        partition: u32,
    ) -> Result<StorageInfo> {
        let (_, lines) = self.simple(
            io,
            config,
            &Request::GetStorageInfo { partition },
            "getstorageinfo",
        )?;
        Ok(StorageInfo { partition, lines })
    }

    /// Select the boot partition.
    pub fn set_bootable<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        drive: u32,
    ) -> Result<()> {
        self.simple(
            io,
            config,
            &Request::SetBootableStorageDrive { drive },
            "setbootablestoragedrive",
        )?;
        info!("Boot partition set to {drive}");
        Ok(())
    }

    /// Reset or power off; the engine is disconnected afterwards.
    pub fn power<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        action: PowerAction,
        delay_secs: u32,
    ) -> Result<()> {
        self.simple(
            io,
            config,
            &Request::Power { action, delay_secs },
            "power",
        )?;
        self.state = CommandState::Disconnected;
        self.negotiated = None;
        Ok(())
    }

    /// Dump device memory; the loader answers with log lines.
    pub fn peek<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        address: u64,
        size: u64,
    ) -> Result<Vec<String>> {
        let (_, lines) = self.simple(io, config, &Request::Peek { address, size }, "peek")?;
        Ok(lines)
    }

    /// Apply one patch entry.
    pub fn patch<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        params: PatchParams,
    ) -> Result<()> {
        self.simple(io, config, &Request::Patch(params), "patch")?;
        Ok(())
    }

    /// Carve general-purpose partitions (sizes in KiB).
    pub fn create_storage_drives<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        config: &SessionConfig,
        sizes_kb: [u32; 4],
    ) -> Result<()> {
        self.simple(
            io,
            config,
            &Request::CreateStorageDrives { sizes_kb },
            "createstoragedrives",
        )?;
        info!("General-purpose partitions created: {sizes_kb:?} KiB");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            image::source::SliceSource,
            protocol::firehose::StorageType,
            session::config::Timeouts,
            sim::{FirehoseDevice, Fault, ScriptedTransport},
        },
    };

    fn config() -> SessionConfig {
        SessionConfig::new(StorageType::Emmc)
            .with_max_payload(64 * 1024)
            .with_timeouts(Timeouts {
                hello: Duration::from_millis(20),
                response: Duration::from_millis(20),
                data: Duration::from_millis(20),
                disconnect: Duration::from_millis(20),
            })
    }

    fn ready(device: &mut FirehoseDevice, config: &SessionConfig) -> CommandEngine {
        let mut engine = CommandEngine::new();
        engine.configure(device, config).unwrap();
        engine
    }

    #[test]
    fn test_configure_clamps_to_granted_payload() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096).with_max_payload(16 * 1024);
        let mut engine = CommandEngine::new();

        let negotiated = engine.configure(&mut device, &config).unwrap();
        assert_eq!(negotiated.max_payload, 16 * 1024);
        assert_eq!(engine.state(), CommandState::Ready);

        let data: Vec<u8> = (0..100 * 512).map(|i| (i % 253) as u8).collect();
        engine
            .program(
                &mut device,
                &config,
                SectorRange::new(10, 100),
                0,
                &mut SliceSource::new(&data),
                |_, _| {},
            )
            .unwrap();
        assert!(device.largest_raw_send() <= 16 * 1024);
    }

    #[test]
    fn test_configure_retries_once_after_nak() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096)
            .with_max_payload(8 * 1024)
            .with_nak_oversized_configure(true);
        let mut engine = CommandEngine::new();

        let negotiated = engine.configure(&mut device, &config).unwrap();
        assert_eq!(negotiated.max_payload, 8 * 1024);
        assert_eq!(device.requests_named("configure").len(), 2);
    }

    #[test]
    fn test_configure_twice_is_idempotent() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096).with_max_payload(32 * 1024);
        let mut engine = CommandEngine::new();

        let first = engine.configure(&mut device, &config).unwrap();
        let second = engine.configure(&mut device, &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_configure_silence_fails_negotiation() {
        let config = config();
        let mut io = ScriptedTransport::new();
        let mut engine = CommandEngine::new();

        let err = engine.configure(&mut io, &config).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::NegotiationFailed(_))
        ));
        assert_eq!(io.sent().len(), 2);
        assert_eq!(engine.state(), CommandState::Disconnected);
    }

    #[test]
    fn test_granted_payload_rounds_to_sectors() {
        let config = SessionConfig::new(StorageType::Ufs).with_timeouts(config().timeouts);
        let mut device = FirehoseDevice::new(4096, 256).with_max_payload(10_000);
        let mut engine = CommandEngine::new();

        let negotiated = engine.configure(&mut device, &config).unwrap();
        assert_eq!(negotiated.max_payload, 8192);
    }

    #[test]
    fn test_write_then_read_back() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096).with_max_payload(4096);
        let mut engine = ready(&mut device, &config);

        // 5000 bytes: ten sectors, the last one zero-padded.
        let data: Vec<u8> = (0..5000).map(|i| (i * 7 % 256) as u8).collect();
        let range = SectorRange::new(100, 10);
        engine
            .program(
                &mut device,
                &config,
                range,
                0,
                &mut SliceSource::new(&data),
                |_, _| {},
            )
            .unwrap();

        let mut out = Vec::new();
        let n = engine
            .read(&mut device, &config, range, 0, &mut out, |_, _| {})
            .unwrap();

        assert_eq!(n, 5120);
        assert_eq!(&out[..5000], data.as_slice());
        assert!(out[5000..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_erase_request_waits_for_ack() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096);
        let mut engine = ready(&mut device, &config);
        device.clear_requests();

        engine
            .erase(
                &mut device,
                &config,
                SectorRange::from_bounds(1000, 1100).unwrap(),
                0,
            )
            .unwrap();

        let requests = device.requests();
        assert_eq!(requests.len(), 1);
        let erase = &requests[0];
        assert_eq!(erase.tag, "erase");
        assert_eq!(erase.attr("start_sector"), Some("1000"));
        assert_eq!(erase.attr("num_partition_sectors"), Some("100"));
        assert_eq!(erase.attr("SECTOR_SIZE_IN_BYTES"), Some("512"));
    }

    #[test]
    fn test_program_nak_is_write_rejected_and_recoverable() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096).with_nak_program_at(8);
        let mut engine = ready(&mut device, &config);

        let err = engine
            .program(
                &mut device,
                &config,
                SectorRange::new(8, 1),
                0,
                &mut SliceSource::new(&[1u8; 512]),
                |_, _| {},
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::WriteRejected(_))
        ));
        assert!(!err.is_fatal_to_session());
        assert_eq!(engine.state(), CommandState::Ready);

        engine
            .program(
                &mut device,
                &config,
                SectorRange::new(9, 1),
                0,
                &mut SliceSource::new(&[2u8; 512]),
                |_, _| {},
            )
            .unwrap();
    }

    #[test]
    fn test_program_rejects_mismatched_source_before_sending() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096);
        let mut engine = ready(&mut device, &config);
        device.clear_requests();

        let err = engine
            .program(
                &mut device,
                &config,
                SectorRange::new(0, 4),
                0,
                &mut SliceSource::new(&[0u8; 512]),
                |_, _| {},
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::WriteRejected(_))
        ));
        assert!(device.requests().is_empty());
    }

    #[test]
    fn test_short_read_is_truncated() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096);
        let mut engine = ready(&mut device, &config);
        device.inject(Fault::ShortRead(1000));

        let mut out = Vec::new();
        let err = engine
            .read(
                &mut device,
                &config,
                SectorRange::new(0, 8),
                0,
                &mut out,
                |_, _| {},
            )
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Truncated {
                expected: 4096,
                received: 3096
            })
        ));
        assert_eq!(engine.state(), CommandState::Disconnected);
    }

    #[test]
    fn test_truncated_xml_is_malformed_and_stops() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096);
        let mut engine = ready(&mut device, &config);
        device.inject(Fault::TruncatedXml);
        device.clear_requests();

        let err = engine
            .erase(&mut device, &config, SectorRange::new(0, 1), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Malformed(_))));
        assert_eq!(engine.state(), CommandState::Disconnected);

        let again = engine
            .erase(&mut device, &config, SectorRange::new(1, 1), 0)
            .unwrap_err();
        assert!(matches!(
            again,
            Error::Protocol(ProtocolError::InvalidState { .. })
        ));
        assert_eq!(device.requests().len(), 1);
    }

    #[test]
    fn test_wrong_envelope_length_is_malformed() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096);
        let mut engine = ready(&mut device, &config);
        device.inject(Fault::OverstatedEnvelope);

        let err = engine
            .set_bootable(&mut device, &config, 1)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Malformed(_))));
        assert_eq!(engine.state(), CommandState::Disconnected);
    }

    #[test]
    fn test_logs_before_response_are_collected() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096);
        let mut engine = ready(&mut device, &config);

        let info = engine
            .storage_info(&mut device, &config, 0)
            .unwrap();
        assert_eq!(info.total_blocks(), Some(4096));
        assert_eq!(info.block_size(), Some(512));
    }

    #[test]
    fn test_operations_require_negotiation() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096);
        let mut engine = CommandEngine::new();

        let err = engine
            .erase(&mut device, &config, SectorRange::new(0, 1), 0)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_power_reset_disconnects_engine() {
        let config = config();
        let mut device = FirehoseDevice::new(512, 4096);
        let mut engine = ready(&mut device, &config);

        engine
            .power(&mut device, &config, PowerAction::Reset, 0)
            .unwrap();
        assert_eq!(engine.state(), CommandState::Disconnected);
        assert!(engine.negotiated().is_none());
    }

    #[test]
    fn test_storage_info_field_forms() {
        let info = StorageInfo {
            partition: 0,
            lines: vec![
                r#"INFO: {"storage_info": {"total_blocks":7634944, "block_size":4096, "mem_type":"UFS"}}"#
                    .into(),
                "INFO: num_physical=6".into(),
            ],
        };
        assert_eq!(info.total_blocks(), Some(7_634_944));
        assert_eq!(info.block_size(), Some(4096));
        assert_eq!(info.field("mem_type").as_deref(), Some("UFS"));
        assert_eq!(info.field("num_physical").as_deref(), Some("6"));
        assert_eq!(info.field("missing"), None);
    }
}
