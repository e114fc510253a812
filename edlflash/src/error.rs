//! Error types for edlflash.
//!
//! Failures are split the way the session controller needs to reason about
//! them: [`TransportError`] for the byte pipe, [`ProtocolError`] for anything
//! the device said (or failed to say), and a handful of host-side variants.

use std::io;
use thiserror::Error;

/// Result type for edlflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the underlying byte pipe.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No device matched the requested endpoint.
    #[error("device not found: {0}")]
    NotFound(String),

    /// The endpoint exists but is held by someone else.
    #[error("device busy: {0}")]
    Busy(String),

    /// Nothing arrived (or could be sent) before the deadline.
    #[error("timed out after {0} ms")]
    Timeout(u128),

    /// The device went away mid-transfer.
    #[error("device disconnected")]
    Disconnected,

    /// Any other I/O failure reported by the pipe.
    #[error("transfer failed: {0}")]
    Failed(String),
}

/// Failures of the bootstrap or command protocol exchange.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The device never produced the expected frame.
    #[error("no response from device: {0}")]
    NoResponse(String),

    /// A frame or document could not be decoded; the stream is likely out of sync.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The loader refused every `configure` attempt.
    #[error("parameter negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A `program` request was NAK'd or its payload did not match the request.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// The device delivered fewer bytes than the request announced.
    #[error("truncated transfer: expected {expected} bytes, received {received}")]
    Truncated {
        /// Bytes the request announced.
        expected: u64,
        /// Bytes actually received.
        received: u64,
    },

    /// Data read back from the device failed its checksum.
    #[error("integrity check failed: {0}")]
    IntegrityCheck(String),

    /// An auxiliary request received a NAK.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The engine was asked to do something its current state does not allow.
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        /// Engine state at the time of the call.
        state: &'static str,
        /// Attempted operation.
        operation: &'static str,
    },
}

/// Error type for edlflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (image files, sinks).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// libusb error.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Host-side image or table could not be parsed.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Unsupported operation for the current device or session.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding application asked us to stop.
    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// Whether the session must reconnect before any further operation.
    ///
    /// Range-level failures (`WriteRejected`, `Truncated`, `IntegrityCheck`,
    /// `Rejected`) leave the session usable; the controller may move on to the
    /// next independent unit of work.
    #[must_use]
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Interrupted => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            #[cfg(feature = "usb")]
            Self::Usb(_) => true,
            Self::Protocol(e) => matches!(
                e,
                ProtocolError::Malformed(_)
                    | ProtocolError::NegotiationFailed(_)
                    | ProtocolError::NoResponse(_)
            ),
            Self::Io(_)
            | Self::InvalidImage(_)
            | Self::Unsupported(_)
            | Self::Config(_) => false,
        }
    }

    /// Shorthand for a malformed-response protocol error.
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::Malformed(msg.into()))
    }

    /// Whether this is a transport timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout(_)))
    }
}
