//! Firehose command documents and their envelope.
//!
//! Each XML document travels behind a 12-byte envelope header:
//!
//! ```text
//! +-----------+-----------+-----------+---------------------+
//! |  Length   |  Version  | Reserved  |  UTF-8 XML document |
//! +-----------+-----------+-----------+---------------------+
//! |  4 bytes  |  4 bytes  |  4 bytes  |  Length bytes       |
//! +-----------+-----------+-----------+---------------------+
//! ```
//!
//! Documents have a single `<data>` root holding one request element
//! (host to device) or any number of `<log>` elements followed by at most
//! one `<response>` (device to host). Raw sector payloads that follow a
//! `rawmode="true"` response are not enveloped.

use {
    crate::{
        error::{Error, Result},
        transport::Transport,
    },
    byteorder::{LittleEndian, WriteBytesExt},
    log::{trace, warn},
    std::{fmt, str::FromStr, time::Duration},
    xmltree::{Element, XMLNode},
};

/// Size of the envelope header.
pub const ENVELOPE_HEADER_LEN: usize = 12;

/// Envelope version understood by both sides.
pub const ENVELOPE_VERSION: u32 = 1;

/// Largest XML document accepted unless the loader announces otherwise.
pub const DEFAULT_MAX_XML_SIZE: usize = 4096;

/// Digest table size announced in `configure`.
pub const MAX_DIGEST_TABLE_SIZE: usize = 8192;

/// Storage technology behind the loader (`MemoryName`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum StorageType {
    /// eMMC.
    Emmc,
    /// UFS (default on current SoCs).
    #[default]
    Ufs,
    /// Raw NAND.
    Nand,
    /// NVMe.
    Nvme,
    /// SPI NOR.
    Spinor,
}

impl StorageType {
    /// Sector size the loader uses unless told otherwise.
    #[must_use]
    pub fn default_sector_size(self) -> usize {
        match self {
            Self::Emmc | Self::Nvme => 512,
            Self::Ufs | Self::Nand | Self::Spinor => 4096,
        }
    }

    /// Value of the `MemoryName` attribute.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emmc => "emmc",
            Self::Ufs => "ufs",
            Self::Nand => "nand",
            Self::Nvme => "nvme",
            Self::Spinor => "spinor",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s
            .to_ascii_lowercase()
            .as_str()
        {
            "emmc" => Ok(Self::Emmc),
            "ufs" => Ok(Self::Ufs),
            "nand" => Ok(Self::Nand),
            "nvme" => Ok(Self::Nvme),
            "spinor" | "spi-nor" => Ok(Self::Spinor),
            other => Err(Error::Config(format!("unknown storage type '{other}'"))),
        }
    }
}

/// What the `power` request should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// Normal reboot.
    Reset,
    /// Reboot straight back into EDL.
    ResetToEdl,
    /// Power off.
    Off,
}

impl PowerAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::ResetToEdl => "reset_to_edl",
            Self::Off => "off",
        }
    }
}

/// A contiguous run of sectors on one physical partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    /// First sector.
    pub start: u64,
    /// Number of sectors.
    pub count: u64,
}

impl SectorRange {
    /// Range covering `count` sectors from `start`.
    #[must_use]
    pub const fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    /// Half-open range `[start, end)`.
    pub fn from_bounds(start: u64, end: u64) -> Result<Self> {
        if end <= start {
            return Err(Error::Config(format!(
                "empty sector range [{start}, {end})"
            )));
        }
        Ok(Self::new(start, end - start))
    }

    /// One past the last sector.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    /// Total bytes covered for the given sector size.
    #[must_use]
    pub fn byte_len(&self, sector_size: usize) -> u64 {
        self.count * sector_size as u64
    }
}

impl fmt::Display for SectorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Parameters of a `configure` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureParams {
    /// Storage technology.
    pub memory: StorageType,
    /// Largest payload the host wants to send per chunk.
    pub max_payload: usize,
    /// Ask the loader for verbose logs.
    pub verbose: bool,
    /// Loader accepts data but does not commit it.
    pub skip_write: bool,
    /// Loader skips storage initialisation.
    pub skip_storage_init: bool,
    /// Host handles zero-length packets.
    pub zlp_aware: bool,
}

/// Fields of a `patch` request as they appear in patch XML files.
///
/// `start_sector` and `value` may be expressions such as
/// `NUM_DISK_SECTORS-5.` that the loader evaluates, so they stay strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchParams {
    /// Sector size in bytes.
    pub sector_size: usize,
    /// Byte offset inside the sector.
    pub byte_offset: u64,
    /// Physical partition (LUN).
    pub partition: u32,
    /// Number of bytes to patch (1..=8).
    pub size_in_bytes: u32,
    /// Sector to patch (number or expression).
    pub start_sector: String,
    /// Value to write (number or expression).
    pub value: String,
}

/// One request element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Negotiate transfer parameters.
    Configure(ConfigureParams),
    /// Write sectors; raw data follows the ACK.
    Program {
        /// Sector size in bytes.
        sector_size: usize,
        /// Target sectors.
        range: SectorRange,
        /// Physical partition (LUN).
        partition: u32,
    },
    /// Read sectors; raw data follows the ACK.
    Read {
        /// Sector size in bytes.
        sector_size: usize,
        /// Source sectors.
        range: SectorRange,
        /// Physical partition (LUN).
        partition: u32,
    },
    /// Erase sectors.
    Erase {
        /// Sector size in bytes.
        sector_size: usize,
        /// Sectors to erase.
        range: SectorRange,
        /// Physical partition (LUN).
        partition: u32,
    },
    /// Ask the loader to describe a physical partition (answer comes as logs).
    GetStorageInfo {
        /// Physical partition (LUN).
        partition: u32,
    },
    /// Select the boot partition.
    SetBootableStorageDrive {
        /// Drive index.
        drive: u32,
    },
    /// Reset or power off.
    Power {
        /// Action to take.
        action: PowerAction,
        /// Delay before acting.
        delay_secs: u32,
    },
    /// Patch a few bytes of a sector.
    Patch(PatchParams),
    /// Dump device memory as log lines.
    Peek {
        /// Start address.
        address: u64,
        /// Bytes to dump.
        size: u64,
    },
    /// Liveness check.
    Nop,
    /// Carve general-purpose partitions (sizes in KiB, drives 4 to 7).
    CreateStorageDrives {
        /// Sizes of GPP1..GPP4 in KiB.
        sizes_kb: [u32; 4],
    },
}

impl Request {
    /// Element name.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Configure(_) => "configure",
            Self::Program { .. } => "program",
            Self::Read { .. } => "read",
            Self::Erase { .. } => "erase",
            Self::GetStorageInfo { .. } => "getstorageinfo",
            Self::SetBootableStorageDrive { .. } => "setbootablestoragedrive",
            Self::Power { .. } => "power",
            Self::Patch(_) => "patch",
            Self::Peek { .. } => "peek",
            Self::Nop => "nop",
            Self::CreateStorageDrives { .. } => "createstoragedrives",
        }
    }

    /// Attribute list in emission order.
    #[must_use]
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        fn flag(b: bool) -> String {
            u8::from(b).to_string()
        }

        match self {
            Self::Configure(p) => vec![
                ("MemoryName", p.memory.to_string()),
                ("Verbose", flag(p.verbose)),
                ("AlwaysValidate", "0".into()),
                ("MaxDigestTableSizeInBytes", MAX_DIGEST_TABLE_SIZE.to_string()),
                ("MaxPayloadSizeToTargetInBytes", p.max_payload.to_string()),
                ("ZLPAwareHost", flag(p.zlp_aware)),
                ("SkipWrite", flag(p.skip_write)),
                ("SkipStorageInit", flag(p.skip_storage_init)),
            ],
            Self::Program {
                sector_size,
                range,
                partition,
            }
            | Self::Read {
                sector_size,
                range,
                partition,
            }
            | Self::Erase {
                sector_size,
                range,
                partition,
            } => vec![
                ("SECTOR_SIZE_IN_BYTES", sector_size.to_string()),
                ("num_partition_sectors", range.count.to_string()),
                ("physical_partition_number", partition.to_string()),
                ("start_sector", range.start.to_string()),
            ],
            Self::GetStorageInfo { partition } => {
                vec![("physical_partition_number", partition.to_string())]
            },
            Self::SetBootableStorageDrive { drive } => vec![("value", drive.to_string())],
            Self::Power { action, delay_secs } => vec![
                ("value", action.as_str().to_string()),
                ("DelayInSeconds", delay_secs.to_string()),
            ],
            Self::Patch(p) => vec![
                ("SECTOR_SIZE_IN_BYTES", p.sector_size.to_string()),
                ("byte_offset", p.byte_offset.to_string()),
                ("filename", "DISK".into()),
                ("physical_partition_number", p.partition.to_string()),
                ("size_in_bytes", p.size_in_bytes.to_string()),
                ("start_sector", p.start_sector.clone()),
                ("value", p.value.clone()),
            ],
            Self::Peek { address, size } => vec![
                ("address64", format!("0x{address:x}")),
                ("SizeInBytes", size.to_string()),
            ],
            Self::Nop => vec![("value", "ping".into())],
            Self::CreateStorageDrives { sizes_kb } => vec![
                ("DRIVE4_SIZE_IN_KB", sizes_kb[0].to_string()),
                ("DRIVE5_SIZE_IN_KB", sizes_kb[1].to_string()),
                ("DRIVE6_SIZE_IN_KB", sizes_kb[2].to_string()),
                ("DRIVE7_SIZE_IN_KB", sizes_kb[3].to_string()),
            ],
        }
    }

    /// Render as a `<data>` document.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut root = Element::new("data");
        let mut op = Element::new(self.tag());
        for (key, value) in self.attributes() {
            op.attributes
                .insert(key.to_owned(), value);
        }
        root.children
            .push(XMLNode::Element(op));

        let mut buf = Vec::new();
        root.write(&mut buf)
            .map_err(|e| Error::Config(format!("cannot render <{}>: {e}", self.tag())))?;
        Ok(buf)
    }
}

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Accepted.
    Ack,
    /// Refused.
    Nak,
}

/// A parsed `<response>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// ACK or NAK.
    pub status: Status,
    /// Raw payload follows immediately.
    pub raw_mode: bool,
    /// Every attribute as sent, in document order.
    pub attributes: Vec<(String, String)>,
}

impl Response {
    /// Look up an attribute by name.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Numeric attribute; present but unparsable is malformed.
    pub fn attr_number(&self, name: &str) -> Result<Option<u64>> {
        self.attr(name)
            .map(|v| {
                parse_number(v).ok_or_else(|| {
                    Error::malformed(format!("attribute {name}=\"{v}\" is not a number"))
                })
            })
            .transpose()
    }

    /// Whether the loader accepted the request.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.status == Status::Ack
    }
}

/// One element of a device document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Informational `<log value=".."/>`.
    Log(String),
    /// Terminal `<response value="ACK|NAK"/>`.
    Response(Response),
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
#[must_use]
pub fn parse_number(s: &str) -> Option<u64> {
    let s = s
        .trim()
        .trim_end_matches('.');
    if let Some(hex) = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse()
            .ok()
    }
}

/// Parse one device document into its messages.
pub fn parse_document(bytes: &[u8]) -> Result<Vec<Message>> {
    let root = Element::parse(bytes).map_err(|e| Error::malformed(format!("bad XML: {e}")))?;
    if root.name != "data" {
        return Err(Error::malformed(format!(
            "expected <data> root, got <{}>",
            root.name
        )));
    }

    let mut messages = Vec::new();
    for node in &root.children {
        let XMLNode::Element(e) = node else {
            continue;
        };
        match e
            .name
            .as_str()
        {
            "log" => {
                let value = e
                    .attributes
                    .get("value")
                    .cloned()
                    .unwrap_or_default();
                messages.push(Message::Log(value));
            },
            "response" => {
                let status = match e
                    .attributes
                    .get("value")
                    .map(String::as_str)
                {
                    Some("ACK") => Status::Ack,
                    Some("NAK") => Status::Nak,
                    Some(other) => {
                        return Err(Error::malformed(format!(
                            "response value \"{other}\" is neither ACK nor NAK"
                        )));
                    },
                    None => return Err(Error::malformed("response without value")),
                };
                let raw_mode = e
                    .attributes
                    .get("rawmode")
                    .is_some_and(|v| v.eq_ignore_ascii_case("true"));
                let attributes = e
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                messages.push(Message::Response(Response {
                    status,
                    raw_mode,
                    attributes,
                }));
            },
            other => warn!("Ignoring unexpected <{other}> element"),
        }
    }

    if messages.is_empty() {
        return Err(Error::malformed("document has neither log nor response"));
    }
    Ok(messages)
}

/// Wrap a document in its envelope.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)] // documents are bounded by the XML size limit
pub fn encode_envelope(document: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + document.len());
    buf.write_u32::<LittleEndian>(document.len() as u32).unwrap();
    buf.write_u32::<LittleEndian>(ENVELOPE_VERSION).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.extend_from_slice(document);
    buf
}

/// Validate an envelope header and return the payload length.
pub fn decode_envelope_header(header: &[u8; ENVELOPE_HEADER_LEN], max_xml: usize) -> Result<usize> {
    let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    let length = word(0) as usize;
    let version = word(4);
    let reserved = word(8);

    if version != ENVELOPE_VERSION {
        return Err(Error::malformed(format!(
            "envelope version {version}, expected {ENVELOPE_VERSION}"
        )));
    }
    if reserved != 0 {
        return Err(Error::malformed(format!(
            "envelope reserved field is 0x{reserved:x}"
        )));
    }
    if length == 0 || length > max_xml {
        return Err(Error::malformed(format!(
            "envelope length {length} outside 1..={max_xml}"
        )));
    }
    Ok(length)
}

/// Send one request in its envelope.
pub fn write_request<T: Transport + ?Sized>(io: &mut T, request: &Request) -> Result<()> {
    let document = request.to_xml()?;
    trace!("Firehose -> {}", String::from_utf8_lossy(&document));
    io.send(&encode_envelope(&document))?;
    Ok(())
}

/// Fill `buf` as far as possible; stops early only on timeout.
///
/// Returns the number of bytes received. Errors other than a timeout are
/// propagated.
pub(crate) fn receive_until_timeout<T: Transport + ?Sized>(
    io: &mut T,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match io.receive(&mut buf[filled..], timeout) {
            Ok(n) => filled += n,
            Err(e) if e.is_timeout() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Receive one enveloped document.
///
/// Silence before the first header byte is a transport timeout. A header or
/// payload cut short is malformed: the envelope promised more than arrived.
pub fn read_document<T: Transport + ?Sized>(
    io: &mut T,
    timeout: Duration,
    max_xml: usize,
) -> Result<Vec<u8>> {
    let mut header = [0u8; ENVELOPE_HEADER_LEN];
    let got = receive_until_timeout(io, &mut header, timeout)?;
    if got == 0 {
        return Err(crate::error::TransportError::Timeout(timeout.as_millis()).into());
    }
    if got < ENVELOPE_HEADER_LEN {
        return Err(Error::malformed(format!(
            "envelope header cut short after {got} bytes"
        )));
    }

    let length = decode_envelope_header(&header, max_xml)?;
    let mut document = vec![0u8; length];
    let got = receive_until_timeout(io, &mut document, timeout)?;
    if got < length {
        return Err(Error::malformed(format!(
            "envelope announced {length} bytes, only {got} arrived"
        )));
    }

    trace!("Firehose <- {}", String::from_utf8_lossy(&document));
    Ok(document)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::error::ProtocolError};

    fn is_malformed(result: &Result<impl std::fmt::Debug>) -> bool {
        matches!(result, Err(Error::Protocol(ProtocolError::Malformed(_))))
    }

    #[test]
    fn test_erase_request_attributes() {
        let request = Request::Erase {
            sector_size: 512,
            range: SectorRange::from_bounds(1000, 1100).unwrap(),
            partition: 0,
        };
        let xml = String::from_utf8(request.to_xml().unwrap()).unwrap();

        assert!(xml.contains("<erase"));
        assert!(xml.contains("start_sector=\"1000\""));
        assert!(xml.contains("num_partition_sectors=\"100\""));
        assert!(xml.contains("SECTOR_SIZE_IN_BYTES=\"512\""));
    }

    #[test]
    fn test_configure_request_carries_negotiation_fields() {
        let request = Request::Configure(ConfigureParams {
            memory: StorageType::Ufs,
            max_payload: 1 << 20,
            verbose: true,
            skip_write: false,
            skip_storage_init: true,
            zlp_aware: true,
        });
        let xml = String::from_utf8(request.to_xml().unwrap()).unwrap();

        assert!(xml.contains("MemoryName=\"ufs\""));
        assert!(xml.contains("MaxPayloadSizeToTargetInBytes=\"1048576\""));
        assert!(xml.contains("Verbose=\"1\""));
        assert!(xml.contains("SkipWrite=\"0\""));
        assert!(xml.contains("SkipStorageInit=\"1\""));
    }

    #[test]
    fn test_parse_logs_then_response() {
        let doc = br#"<?xml version="1.0" encoding="UTF-8" ?>
<data>
<log value="INFO: Calling handler for configure" />
<response value="ACK" MaxPayloadSizeToTargetInBytes="0x100000" rawmode="false" />
</data>"#;
        let messages = parse_document(doc).unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0],
            Message::Log("INFO: Calling handler for configure".into())
        );
        let Message::Response(response) = &messages[1] else {
            panic!("expected a response");
        };
        assert!(response.is_ack());
        assert!(!response.raw_mode);
        assert_eq!(
            response
                .attr_number("MaxPayloadSizeToTargetInBytes")
                .unwrap(),
            Some(0x10_0000)
        );
    }

    #[test]
    fn test_parse_rejects_truncated_xml() {
        let doc = br#"<?xml version="1.0" ?><data><response value="AC"#;
        assert!(is_malformed(&parse_document(doc)));
    }

    #[test]
    fn test_parse_rejects_unknown_status() {
        let doc = br#"<data><response value="MAYBE" /></data>"#;
        assert!(is_malformed(&parse_document(doc)));
    }

    #[test]
    fn test_parse_rejects_wrong_root() {
        let doc = br#"<configure><response value="ACK" /></configure>"#;
        assert!(is_malformed(&parse_document(doc)));
    }

    #[test]
    fn test_parse_rejects_empty_data() {
        assert!(is_malformed(&parse_document(b"<data></data>")));
    }

    #[test]
    fn test_envelope_header_checks() {
        let envelope = encode_envelope(b"<data/>");
        let mut header = [0u8; ENVELOPE_HEADER_LEN];
        header.copy_from_slice(&envelope[..ENVELOPE_HEADER_LEN]);
        assert_eq!(decode_envelope_header(&header, 4096).unwrap(), 7);

        let mut bad_version = header;
        bad_version[4] = 2;
        assert!(is_malformed(&decode_envelope_header(&bad_version, 4096)));

        let mut bad_reserved = header;
        bad_reserved[8] = 1;
        assert!(is_malformed(&decode_envelope_header(&bad_reserved, 4096)));

        assert!(is_malformed(&decode_envelope_header(&header, 4)));
    }

    #[test]
    fn test_parse_number_forms() {
        assert_eq!(parse_number("4096"), Some(4096));
        assert_eq!(parse_number("0x1000"), Some(4096));
        assert_eq!(parse_number(" 34. "), Some(34));
        assert_eq!(parse_number("NUM_DISK_SECTORS-33."), None);
    }

    #[test]
    fn test_storage_type_defaults() {
        assert_eq!(StorageType::Emmc.default_sector_size(), 512);
        assert_eq!(StorageType::Ufs.default_sector_size(), 4096);
        assert_eq!("UFS".parse::<StorageType>().unwrap(), StorageType::Ufs);
        assert!("floppy".parse::<StorageType>().is_err());
    }

    #[test]
    fn test_sector_range_bounds() {
        let range = SectorRange::from_bounds(1000, 1100).unwrap();
        assert_eq!(range.count, 100);
        assert_eq!(range.end(), 1100);
        assert_eq!(range.byte_len(512), 51_200);
        assert!(SectorRange::from_bounds(5, 5).is_err());
    }
}
