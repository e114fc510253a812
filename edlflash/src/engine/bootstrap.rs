//! Boot ROM handshake and loader upload.
//!
//! ```text
//! Idle -> DeviceDetectPending -> Authenticated -> LoaderUploadPending -> HandoffSent
//!   \_____________________\_____________________\______________________-> Closed
//! ```
//!
//! The boot ROM drives the upload: it names every slice it wants with a
//! `ReadData` request and the host answers with exactly that slice before
//! reading the next frame. Nothing is ever sent ahead of a request.

use {
    crate::{
        error::{Error, ProtocolError, Result},
        protocol::sahara::{self, ClientCommand, Mode, Packet, STATUS_SUCCESS},
        transport::Transport,
    },
    log::{debug, info, warn},
    std::{fmt, time::Duration},
};

/// Bootstrap engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nothing exchanged yet.
    Idle,
    /// Waiting for the boot ROM greeting.
    DeviceDetectPending,
    /// Greeting received, ready for the loader.
    Authenticated,
    /// Loader slices are being served.
    LoaderUploadPending,
    /// The boot ROM has jumped into the loader.
    HandoffSent,
    /// Terminal failure or reset; no further frames are valid.
    Closed,
}

impl BootstrapState {
    /// Short state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::DeviceDetectPending => "DeviceDetectPending",
            Self::Authenticated => "Authenticated",
            Self::LoaderUploadPending => "LoaderUploadPending",
            Self::HandoffSent => "HandoffSent",
            Self::Closed => "Closed",
        }
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity reported by the boot ROM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Chip serial number.
    pub serial: Option<u32>,
    /// MSM hardware ID.
    pub hw_id: Option<u64>,
    /// OEM public-key hash, lowercase hex.
    pub pk_hash: Option<String>,
    /// Boot ROM software version.
    pub sw_version: Option<u32>,
    /// Bootstrap protocol version from the greeting.
    pub protocol_version: u32,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(v: Option<T>) -> String {
            v.map_or_else(|| "unknown".into(), |v| v.to_string())
        }

        writeln!(f, "Serial:      {}", opt(self.serial.map(|s| format!("0x{s:08x}"))))?;
        writeln!(f, "HW ID:       {}", opt(self.hw_id.map(|h| format!("0x{h:016x}"))))?;
        writeln!(f, "PK hash:     {}", opt(self.pk_hash.as_deref()))?;
        writeln!(f, "SW version:  {}", opt(self.sw_version.map(|v| format!("0x{v:08x}"))))?;
        write!(f, "Protocol:    v{}", self.protocol_version)
    }
}

/// Bootstrap protocol state machine.
#[derive(Debug)]
pub struct BootstrapEngine {
    state: BootstrapState,
    timeout: Duration,
    device_version: u32,
}

impl BootstrapEngine {
    /// Engine waiting up to `timeout` for every frame.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: BootstrapState::Idle,
            timeout,
            device_version: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    fn require(&self, expected: BootstrapState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::InvalidState {
                state: self.state.as_str(),
                operation,
            }
            .into())
        }
    }

    fn close(&mut self, err: Error) -> Error {
        debug!("Bootstrap engine closed in {}: {err}", self.state);
        self.state = BootstrapState::Closed;
        err
    }

    fn read<T: Transport + ?Sized>(&mut self, io: &mut T) -> Result<Packet> {
        sahara::read_packet(io, self.timeout).map_err(|e| self.close(e))
    }

    fn write<T: Transport + ?Sized>(&mut self, io: &mut T, packet: &Packet) -> Result<()> {
        sahara::write_packet(io, packet).map_err(|e| self.close(e))
    }

    fn unexpected(&mut self, packet: &Packet, waiting_for: &str) -> Error {
        self.close(Error::malformed(format!(
            "expected {waiting_for}, got {:?}",
            packet.command()
        )))
    }

    /// Wait for the greeting. Silence or garbage here means no boot ROM is
    /// listening, which is reported as `NoResponse`.
    fn await_hello<T: Transport + ?Sized>(&mut self, io: &mut T) -> Result<Mode> {
        let packet = sahara::read_packet(io, self.timeout).map_err(|e| {
            let timed_out = e.is_timeout();
            let err = match e {
                Error::Transport(t) if timed_out => {
                    ProtocolError::NoResponse(format!("no greeting from boot ROM ({t})")).into()
                },
                Error::Protocol(ProtocolError::Malformed(msg)) => {
                    ProtocolError::NoResponse(format!("unreadable greeting: {msg}")).into()
                },
                other => other,
            };
            self.close(err)
        })?;

        match packet {
            Packet::Hello {
                version,
                max_command_len,
                mode,
                ..
            } => {
                debug!("Hello: version {version}, mode {mode:?}, max command {max_command_len}");
                self.device_version = version;
                Ok(mode)
            },
            other => Err(self.unexpected(&other, "Hello")),
        }
    }

    /// Wait for the greeting without querying the identity.
    pub fn authenticate<T: Transport + ?Sized>(&mut self, io: &mut T) -> Result<()> {
        self.require(BootstrapState::Idle, "authenticate")?;
        self.state = BootstrapState::DeviceDetectPending;

        let mode = self.await_hello(io)?;
        if mode != Mode::ImageTransferPending {
            warn!("Boot ROM greeted in mode {mode:?}; expecting a loader request anyway");
        }
        self.state = BootstrapState::Authenticated;
        Ok(())
    }

    /// Read serial number, hardware ID, key hash and version, then return the
    /// boot ROM to image-transfer mode.
    pub fn identify<T: Transport + ?Sized>(&mut self, io: &mut T) -> Result<DeviceInfo> {
        self.require(BootstrapState::Idle, "identify")?;
        self.state = BootstrapState::DeviceDetectPending;

        self.await_hello(io)?;
        self.write(io, &Packet::hello_response(Mode::Command))?;
        match self.read(io)? {
            Packet::CommandReady => {},
            other => return Err(self.unexpected(&other, "CommandReady")),
        }

        let mut info = DeviceInfo {
            protocol_version: self.device_version,
            ..DeviceInfo::default()
        };
        let serial = self.execute(io, ClientCommand::SerialNumber)?;
        info.serial = le_u32(&serial);
        let hw_id = self.execute(io, ClientCommand::HardwareId)?;
        info.hw_id = le_u64(&hw_id);
        let pk_hash = self.execute(io, ClientCommand::PkHash)?;
        if !pk_hash.is_empty() {
            info.pk_hash = Some(hex(&pk_hash));
        }
        let version = self.execute(io, ClientCommand::SoftwareVersion)?;
        info.sw_version = le_u32(&version);

        self.write(
            io,
            &Packet::SwitchMode {
                mode: Mode::ImageTransferPending,
            },
        )?;
        let mode = self.await_hello(io)?;
        debug!("Boot ROM back in mode {mode:?}");

        self.state = BootstrapState::Authenticated;
        info!("Device identified: serial {:?}, hw id {:?}", info.serial, info.hw_id);
        Ok(info)
    }

    fn execute<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        command: ClientCommand,
    ) -> Result<Vec<u8>> {
        let code = command as u32;
        self.write(io, &Packet::Execute { command: code })?;
        let data_len = match self.read(io)? {
            Packet::ExecuteResponse { command, data_len } if command == code => data_len,
            other => return Err(self.unexpected(&other, "ExecuteResponse")),
        };

        self.write(io, &Packet::ExecuteData { command: code })?;
        let mut data = vec![0u8; data_len as usize];
        if !data.is_empty() {
            let timeout = self.timeout;
            io.receive_exact(&mut data, timeout)
                .map_err(|e| self.close(e))?;
        }
        debug!("{command:?}: {} bytes", data.len());
        Ok(data)
    }

    /// Serve the loader image to the boot ROM and hand control to it.
    ///
    /// `progress` receives `(bytes_sent, total)` after each slice. Returns the
    /// number of slices served.
    pub fn upload_loader<T, F>(&mut self, io: &mut T, loader: &[u8], mut progress: F) -> Result<usize>
    where
        T: Transport + ?Sized,
        F: FnMut(usize, usize),
    {
        self.require(BootstrapState::Authenticated, "upload_loader")?;
        if loader.is_empty() {
            return Err(Error::InvalidImage("loader image is empty".into()));
        }

        self.state = BootstrapState::LoaderUploadPending;
        self.write(io, &Packet::hello_response(Mode::ImageTransferPending))?;

        let total = loader.len();
        let mut sent = 0usize;
        let mut slices = 0usize;
        loop {
            match self.read(io)? {
                Packet::ReadData {
                    image_id,
                    offset,
                    length,
                    ..
                } => {
                    let end = offset
                        .checked_add(length)
                        .filter(|end| *end <= total as u64);
                    let Some(end) = end else {
                        return Err(self.close(Error::malformed(format!(
                            "image {image_id}: request for {length} bytes at {offset} exceeds the \
                             {total}-byte loader"
                        ))));
                    };
                    #[allow(clippy::cast_possible_truncation)] // bounded by loader.len()
                    let slice = &loader[offset as usize..end as usize];
                    io.send(slice)
                        .map_err(|e| self.close(e))?;
                    slices += 1;
                    sent = sent.saturating_add(slice.len()).min(total);
                    progress(sent, total);
                },
                Packet::EndOfImage { image_id, status } => {
                    if status != STATUS_SUCCESS {
                        return Err(self.close(
                            ProtocolError::Rejected(format!(
                                "boot ROM refused image {image_id} (status 0x{status:x})"
                            ))
                            .into(),
                        ));
                    }
                    debug!("End of image {image_id} after {slices} slices");
                    break;
                },
                other => return Err(self.unexpected(&other, "ReadData or EndOfImage")),
            }
        }

        self.write(io, &Packet::Done)?;
        match self.read(io)? {
            Packet::DoneResponse { image_tx_status } => {
                debug!("Done acknowledged (status {image_tx_status})");
            },
            other => return Err(self.unexpected(&other, "DoneResponse")),
        }

        self.state = BootstrapState::HandoffSent;
        info!("Loader handed off ({total} bytes in {slices} slices)");
        Ok(slices)
    }

    /// Ask the boot ROM to reset the device.
    pub fn reset<T: Transport + ?Sized>(&mut self, io: &mut T) -> Result<()> {
        if matches!(self.state, BootstrapState::HandoffSent | BootstrapState::Closed) {
            return Err(ProtocolError::InvalidState {
                state: self.state.as_str(),
                operation: "reset",
            }
            .into());
        }

        self.write(io, &Packet::Reset)?;
        match self.read(io)? {
            Packet::ResetResponse => {
                self.state = BootstrapState::Closed;
                info!("Boot ROM reset acknowledged");
                Ok(())
            },
            other => Err(self.unexpected(&other, "ResetResponse")),
        }
    }
}

fn le_u32(bytes: &[u8]) -> Option<u32> {
    bytes
        .get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_u64(bytes: &[u8]) -> Option<u64> {
    let b = bytes.get(..8)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(b);
    Some(u64::from_le_bytes(word))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}
