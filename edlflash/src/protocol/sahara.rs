//! Sahara bootstrap protocol frames.
//!
//! Every frame starts with the same 8-byte header; the length covers the
//! whole frame including the header. All fields are little-endian.
//!
//! ```text
//! +-----------+-----------+---------------------------+
//! |  Command  |  Length   |  Command-specific fields  |
//! +-----------+-----------+---------------------------+
//! |  4 bytes  |  4 bytes  |  Length - 8 bytes         |
//! +-----------+-----------+---------------------------+
//! ```
//!
//! Decoding is strict: the length field must equal both the number of bytes
//! handed in and the fixed size of the command, and unknown command codes
//! are rejected.

use {
    crate::{
        error::{Error, Result},
        transport::Transport,
    },
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    log::trace,
    std::{io::Cursor, time::Duration},
};

/// Size of the common frame header.
pub const HEADER_LEN: usize = 8;

/// Largest frame the host accepts; every defined frame is far smaller.
pub const MAX_FRAME_LEN: usize = 0x400;

/// Protocol version the host announces.
pub const HOST_VERSION: u32 = 2;

/// Oldest protocol version the host still speaks.
pub const HOST_VERSION_COMPATIBLE: u32 = 1;

/// `HelloResponse` status meaning "accepted".
pub const STATUS_SUCCESS: u32 = 0;

/// Sahara command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Device greeting (0x01).
    Hello = 0x01,
    /// Host answer to `Hello` (0x02).
    HelloResponse = 0x02,
    /// Device asks for a slice of the image, 32-bit fields (0x03).
    ReadData = 0x03,
    /// Device reports the end of an image transfer (0x04).
    EndOfImage = 0x04,
    /// Host finishes the transfer session (0x05).
    Done = 0x05,
    /// Device acknowledges `Done` (0x06).
    DoneResponse = 0x06,
    /// Host requests a reset (0x07).
    Reset = 0x07,
    /// Device acknowledges `Reset` (0x08).
    ResetResponse = 0x08,
    /// Device offers a memory dump (0x09).
    MemoryDebug = 0x09,
    /// Host reads device memory (0x0A).
    MemoryRead = 0x0A,
    /// Device is ready for client commands (0x0B).
    CommandReady = 0x0B,
    /// Host switches the device to another mode (0x0C).
    SwitchMode = 0x0C,
    /// Host runs a client command (0x0D).
    Execute = 0x0D,
    /// Device announces the result length of a client command (0x0E).
    ExecuteResponse = 0x0E,
    /// Host asks for the client command result (0x0F).
    ExecuteData = 0x0F,
    /// Device offers a memory dump, 64-bit fields (0x10).
    MemoryDebug64 = 0x10,
    /// Host reads device memory, 64-bit fields (0x11).
    MemoryRead64 = 0x11,
    /// Device asks for a slice of the image, 64-bit fields (0x12).
    ReadData64 = 0x12,
}

impl Command {
    /// Fixed on-wire size of frames carrying this command.
    #[must_use]
    pub fn frame_len(self) -> usize {
        match self {
            Self::Hello | Self::HelloResponse => 48,
            Self::ReadData => 20,
            Self::EndOfImage | Self::MemoryDebug | Self::MemoryRead | Self::ExecuteResponse => 16,
            Self::Done | Self::Reset | Self::ResetResponse | Self::CommandReady => 8,
            Self::DoneResponse | Self::SwitchMode | Self::Execute | Self::ExecuteData => 12,
            Self::MemoryDebug64 | Self::MemoryRead64 => 24,
            Self::ReadData64 => 32,
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0x01 => Self::Hello,
            0x02 => Self::HelloResponse,
            0x03 => Self::ReadData,
            0x04 => Self::EndOfImage,
            0x05 => Self::Done,
            0x06 => Self::DoneResponse,
            0x07 => Self::Reset,
            0x08 => Self::ResetResponse,
            0x09 => Self::MemoryDebug,
            0x0A => Self::MemoryRead,
            0x0B => Self::CommandReady,
            0x0C => Self::SwitchMode,
            0x0D => Self::Execute,
            0x0E => Self::ExecuteResponse,
            0x0F => Self::ExecuteData,
            0x10 => Self::MemoryDebug64,
            0x11 => Self::MemoryRead64,
            0x12 => Self::ReadData64,
            other => return Err(Error::malformed(format!("unknown command 0x{other:02x}"))),
        })
    }
}

/// Operating mode carried by `Hello`, `HelloResponse` and `SwitchMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Mode {
    /// Waiting for an image upload.
    ImageTransferPending = 0,
    /// Image upload finished.
    ImageTransferComplete = 1,
    /// Crash dump available.
    MemoryDebug = 2,
    /// Client command mode (identity queries).
    Command = 3,
}

impl TryFrom<u32> for Mode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::ImageTransferPending,
            1 => Self::ImageTransferComplete,
            2 => Self::MemoryDebug,
            3 => Self::Command,
            other => return Err(Error::malformed(format!("unknown mode {other}"))),
        })
    }
}

/// Client commands available in [`Mode::Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientCommand {
    /// 32-bit chip serial number.
    SerialNumber = 0x01,
    /// MSM hardware ID.
    HardwareId = 0x02,
    /// Hash of the OEM root public key.
    PkHash = 0x03,
    /// Boot ROM / SBL software version.
    SoftwareVersion = 0x07,
}

/// One decoded Sahara frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Device greeting.
    Hello {
        /// Protocol version spoken by the device.
        version: u32,
        /// Oldest version the device accepts.
        version_compatible: u32,
        /// Largest command frame the device accepts.
        max_command_len: u32,
        /// Mode the device is in.
        mode: Mode,
    },
    /// Host answer to `Hello`.
    HelloResponse {
        /// Protocol version spoken by the host.
        version: u32,
        /// Oldest version the host accepts.
        version_compatible: u32,
        /// Host status (0 = success).
        status: u32,
        /// Mode the host wants the device to enter.
        mode: Mode,
    },
    /// Device asks for `length` bytes at `offset` of image `image_id`.
    ReadData {
        /// Image being requested.
        image_id: u64,
        /// Byte offset into the image.
        offset: u64,
        /// Number of bytes wanted.
        length: u64,
        /// Whether the request used the 64-bit frame layout.
        wide: bool,
    },
    /// Device ends the image transfer.
    EndOfImage {
        /// Image that finished.
        image_id: u32,
        /// Device status (0 = success).
        status: u32,
    },
    /// Host ends the transfer session.
    Done,
    /// Device acknowledges `Done`.
    DoneResponse {
        /// 0 = more images pending, 1 = transfer complete.
        image_tx_status: u32,
    },
    /// Host requests a reset.
    Reset,
    /// Device acknowledges `Reset`.
    ResetResponse,
    /// Device offers a memory dump table.
    MemoryDebug {
        /// Address of the region table.
        table_address: u64,
        /// Length of the region table.
        table_length: u64,
        /// Whether the 64-bit frame layout was used.
        wide: bool,
    },
    /// Device is ready for client commands.
    CommandReady,
    /// Host switches the device into `mode`.
    SwitchMode {
        /// Target mode.
        mode: Mode,
    },
    /// Host runs a client command.
    Execute {
        /// Client command code.
        command: u32,
    },
    /// Device announces the size of a client command result.
    ExecuteResponse {
        /// Client command code.
        command: u32,
        /// Number of raw bytes that follow `ExecuteData`.
        data_len: u32,
    },
    /// Host asks for the client command result.
    ExecuteData {
        /// Client command code.
        command: u32,
    },
}

impl Packet {
    /// Build the host's `HelloResponse` for the given mode.
    #[must_use]
    pub fn hello_response(mode: Mode) -> Self {
        Self::HelloResponse {
            version: HOST_VERSION,
            version_compatible: HOST_VERSION_COMPATIBLE,
            status: STATUS_SUCCESS,
            mode,
        }
    }

    /// Command code of this frame.
    #[must_use]
    pub fn command(&self) -> Command {
        match self {
            Self::Hello { .. } => Command::Hello,
            Self::HelloResponse { .. } => Command::HelloResponse,
            Self::ReadData { wide: false, .. } => Command::ReadData,
            Self::ReadData { wide: true, .. } => Command::ReadData64,
            Self::EndOfImage { .. } => Command::EndOfImage,
            Self::Done => Command::Done,
            Self::DoneResponse { .. } => Command::DoneResponse,
            Self::Reset => Command::Reset,
            Self::ResetResponse => Command::ResetResponse,
            Self::MemoryDebug { wide: false, .. } => Command::MemoryDebug,
            Self::MemoryDebug { wide: true, .. } => Command::MemoryDebug64,
            Self::CommandReady => Command::CommandReady,
            Self::SwitchMode { .. } => Command::SwitchMode,
            Self::Execute { .. } => Command::Execute,
            Self::ExecuteResponse { .. } => Command::ExecuteResponse,
            Self::ExecuteData { .. } => Command::ExecuteData,
        }
    }

    /// Serialize to the wire format.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)] // 32-bit layouts only carry 32-bit values
    pub fn encode(&self) -> Vec<u8> {
        let command = self.command();
        let len = command.frame_len();
        let mut buf = Vec::with_capacity(len);
        buf.write_u32::<LittleEndian>(command as u32).unwrap();
        buf.write_u32::<LittleEndian>(len as u32).unwrap();

        match *self {
            Self::Hello {
                version,
                version_compatible,
                max_command_len: field,
                mode,
            }
            | Self::HelloResponse {
                version,
                version_compatible,
                status: field,
                mode,
            } => {
                buf.write_u32::<LittleEndian>(version).unwrap();
                buf.write_u32::<LittleEndian>(version_compatible).unwrap();
                buf.write_u32::<LittleEndian>(field).unwrap();
                buf.write_u32::<LittleEndian>(mode as u32).unwrap();
                // reserved[6]
                buf.resize(len, 0);
            },
            Self::ReadData {
                image_id,
                offset,
                length,
                wide,
            } => {
                if wide {
                    buf.write_u64::<LittleEndian>(image_id).unwrap();
                    buf.write_u64::<LittleEndian>(offset).unwrap();
                    buf.write_u64::<LittleEndian>(length).unwrap();
                } else {
                    buf.write_u32::<LittleEndian>(image_id as u32).unwrap();
                    buf.write_u32::<LittleEndian>(offset as u32).unwrap();
                    buf.write_u32::<LittleEndian>(length as u32).unwrap();
                }
            },
            Self::EndOfImage { image_id, status } => {
                buf.write_u32::<LittleEndian>(image_id).unwrap();
                buf.write_u32::<LittleEndian>(status).unwrap();
            },
            Self::DoneResponse { image_tx_status } => {
                buf.write_u32::<LittleEndian>(image_tx_status).unwrap();
            },
            Self::MemoryDebug {
                table_address,
                table_length,
                wide,
            } => {
                if wide {
                    buf.write_u64::<LittleEndian>(table_address).unwrap();
                    buf.write_u64::<LittleEndian>(table_length).unwrap();
                } else {
                    buf.write_u32::<LittleEndian>(table_address as u32).unwrap();
                    buf.write_u32::<LittleEndian>(table_length as u32).unwrap();
                }
            },
            Self::SwitchMode { mode } => {
                buf.write_u32::<LittleEndian>(mode as u32).unwrap();
            },
            Self::Execute { command } | Self::ExecuteData { command } => {
                buf.write_u32::<LittleEndian>(command).unwrap();
            },
            Self::ExecuteResponse { command, data_len } => {
                buf.write_u32::<LittleEndian>(command).unwrap();
                buf.write_u32::<LittleEndian>(data_len).unwrap();
            },
            Self::Done | Self::Reset | Self::ResetResponse | Self::CommandReady => {},
        }

        debug_assert_eq!(buf.len(), len);
        buf
    }

    /// Decode one complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::malformed(format!(
                "frame of {} bytes is shorter than the header",
                bytes.len()
            )));
        }

        let mut cur = Cursor::new(bytes);
        let command = Command::try_from(read_u32(&mut cur)?)?;
        let declared = read_u32(&mut cur)? as usize;

        if declared != bytes.len() {
            return Err(Error::malformed(format!(
                "{command:?} declares {declared} bytes but {} were received",
                bytes.len()
            )));
        }
        if declared != command.frame_len() {
            return Err(Error::malformed(format!(
                "{command:?} must be {} bytes, got {declared}",
                command.frame_len()
            )));
        }

        let packet = match command {
            Command::Hello | Command::HelloResponse => {
                let version = read_u32(&mut cur)?;
                let version_compatible = read_u32(&mut cur)?;
                let field = read_u32(&mut cur)?;
                let mode = Mode::try_from(read_u32(&mut cur)?)?;
                if command == Command::Hello {
                    Self::Hello {
                        version,
                        version_compatible,
                        max_command_len: field,
                        mode,
                    }
                } else {
                    Self::HelloResponse {
                        version,
                        version_compatible,
                        status: field,
                        mode,
                    }
                }
            },
            Command::ReadData => Self::ReadData {
                image_id: u64::from(read_u32(&mut cur)?),
                offset: u64::from(read_u32(&mut cur)?),
                length: u64::from(read_u32(&mut cur)?),
                wide: false,
            },
            Command::ReadData64 => Self::ReadData {
                image_id: read_u64(&mut cur)?,
                offset: read_u64(&mut cur)?,
                length: read_u64(&mut cur)?,
                wide: true,
            },
            Command::EndOfImage => Self::EndOfImage {
                image_id: read_u32(&mut cur)?,
                status: read_u32(&mut cur)?,
            },
            Command::Done => Self::Done,
            Command::DoneResponse => Self::DoneResponse {
                image_tx_status: read_u32(&mut cur)?,
            },
            Command::Reset => Self::Reset,
            Command::ResetResponse => Self::ResetResponse,
            Command::MemoryDebug => Self::MemoryDebug {
                table_address: u64::from(read_u32(&mut cur)?),
                table_length: u64::from(read_u32(&mut cur)?),
                wide: false,
            },
            Command::MemoryDebug64 => Self::MemoryDebug {
                table_address: read_u64(&mut cur)?,
                table_length: read_u64(&mut cur)?,
                wide: true,
            },
            Command::CommandReady => Self::CommandReady,
            Command::SwitchMode => Self::SwitchMode {
                mode: Mode::try_from(read_u32(&mut cur)?)?,
            },
            Command::Execute => Self::Execute {
                command: read_u32(&mut cur)?,
            },
            Command::ExecuteResponse => Self::ExecuteResponse {
                command: read_u32(&mut cur)?,
                data_len: read_u32(&mut cur)?,
            },
            Command::ExecuteData => Self::ExecuteData {
                command: read_u32(&mut cur)?,
            },
            Command::MemoryRead | Command::MemoryRead64 => {
                return Err(Error::malformed(format!(
                    "{command:?} is only sent by the host"
                )));
            },
        };

        Ok(packet)
    }
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32> {
    cur.read_u32::<LittleEndian>()
        .map_err(|_| Error::malformed("frame ends inside a field"))
}

fn read_u64(cur: &mut Cursor<&[u8]>) -> Result<u64> {
    cur.read_u64::<LittleEndian>()
        .map_err(|_| Error::malformed("frame ends inside a field"))
}

/// Read one frame: the header first, then exactly the declared remainder.
pub fn read_packet<T: Transport + ?Sized>(io: &mut T, timeout: Duration) -> Result<Packet> {
    let mut header = [0u8; HEADER_LEN];
    io.receive_exact(&mut header, timeout)?;

    let declared = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&declared) {
        return Err(Error::malformed(format!(
            "frame length {declared} out of range"
        )));
    }

    let mut frame = vec![0u8; declared];
    frame[..HEADER_LEN].copy_from_slice(&header);
    io.receive_exact(&mut frame[HEADER_LEN..], timeout)?;

    let packet = Packet::decode(&frame)?;
    trace!("Sahara <- {packet:?}");
    Ok(packet)
}

/// Send one frame.
pub fn write_packet<T: Transport + ?Sized>(io: &mut T, packet: &Packet) -> Result<()> {
    trace!("Sahara -> {packet:?}");
    io.send(&packet.encode())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_response_layout() {
        let frame = Packet::hello_response(Mode::ImageTransferPending).encode();

        assert_eq!(frame.len(), 48);
        assert_eq!(&frame[0..4], &2u32.to_le_bytes());
        assert_eq!(&frame[4..8], &48u32.to_le_bytes());
        assert_eq!(&frame[8..12], &HOST_VERSION.to_le_bytes());
        assert_eq!(&frame[12..16], &HOST_VERSION_COMPATIBLE.to_le_bytes());
        assert_eq!(&frame[16..20], &STATUS_SUCCESS.to_le_bytes());
        assert_eq!(&frame[20..24], &0u32.to_le_bytes());
        assert!(frame[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_read_data64() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&0x12u32.to_le_bytes());
        frame.extend_from_slice(&32u32.to_le_bytes());
        frame.extend_from_slice(&13u64.to_le_bytes());
        frame.extend_from_slice(&0x4_0000u64.to_le_bytes());
        frame.extend_from_slice(&0x1000u64.to_le_bytes());

        assert_eq!(
            Packet::decode(&frame).unwrap(),
            Packet::ReadData {
                image_id: 13,
                offset: 0x4_0000,
                length: 0x1000,
                wide: true,
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&0x42u32.to_le_bytes());
        frame.extend_from_slice(&8u32.to_le_bytes());

        let err = Packet::decode(&frame).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut frame = Packet::EndOfImage {
            image_id: 13,
            status: 0,
        }
        .encode();
        frame.push(0);

        assert!(matches!(
            Packet::decode(&frame),
            Err(Error::Protocol(crate::error::ProtocolError::Malformed(_)))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_fixed_size() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&0x0Bu32.to_le_bytes());
        frame.extend_from_slice(&12u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());

        let err = Packet::decode(&frame).unwrap_err();
        assert!(err.to_string().contains("must be 8 bytes"));
    }

    #[test]
    fn test_decode_rejects_host_only_frames() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&0x0Au32.to_le_bytes());
        frame.extend_from_slice(&16u32.to_le_bytes());
        frame.extend_from_slice(&[0u8; 8]);

        assert!(Packet::decode(&frame).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_mode() {
        let mut frame = Packet::SwitchMode {
            mode: Mode::Command,
        }
        .encode();
        frame[8..12].copy_from_slice(&9u32.to_le_bytes());

        assert!(Packet::decode(&frame).is_err());
    }
}
