//! # edlflash
//!
//! A library for flashing Qualcomm devices in Emergency Download (EDL) mode.
//!
//! A device in EDL mode speaks two protocols, one after the other:
//!
//! - the boot ROM's binary **bootstrap** protocol (Sahara), used to read the
//!   device identity and to upload a signed flashing loader
//! - the loader's XML **command** protocol (Firehose), used for every storage
//!   operation: read, program, erase, partition tables, boot selection
//!
//! [`Session`] drives both over a [`Transport`] and exposes the operations.
//!
//! ## Features
//!
//! - `native` (default): serial transport (`qcserial` / QDLoader) and port
//!   discovery via the `serialport` crate
//! - `usb`: direct bulk transport via `rusb`
//! - `serde`: serialization support for reported data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use edlflash::{SectorRange, Session, SessionConfig, StorageType};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         use edlflash::transport::serial::{SerialConfig, SerialTransport};
//!
//!         let port = SerialTransport::open(SerialConfig::new("/dev/ttyUSB0"))?;
//!         let mut session = Session::new(port, SessionConfig::new(StorageType::Ufs));
//!
//!         session.connect()?;
//!         session.load_agent("prog_firehose_ddr.elf", |sent, total| {
//!             println!("loader: {sent}/{total}");
//!         })?;
//!
//!         let mut gpt = Vec::new();
//!         session.read_range(SectorRange::new(0, 6), &mut gpt, |_, _| {})?;
//!         session.reset_device()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod engine;
pub mod error;
pub mod host;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod sim;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker consulted between operations.
///
/// The checker should return `true` when the session should stop before
/// starting its next operation (for example after Ctrl-C in a CLI). Chunk
/// transfers already under way are never cut short.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::serial::{SerialConfig, SerialTransport};
#[cfg(feature = "usb")]
pub use transport::usb::{UsbConfig, UsbTransport};
pub use {
    device::{DetectedPort, DeviceKind, TransportKind},
    engine::{BootstrapState, CommandState, DeviceInfo, Negotiated, StorageInfo},
    error::{Error, ProtocolError, Result, TransportError},
    host::{auto_detect_port, discover_ports},
    image::{FileSource, Gpt, GptEntry, ImageSource, ProgramFile, SliceSource},
    protocol::{PowerAction, SectorRange, StorageType},
    session::{
        BatchEntry, BatchReport, DeviceMode, Outcome, Protocol, Session, SessionConfig,
        SessionState, Timeouts,
    },
    transport::{RetryPolicy, Transport},
};
