//! Protocol state machines.
//!
//! Engines own no I/O handle. Every call borrows the session's
//! [`Transport`](crate::transport::Transport) and configuration, so the
//! session controller stays the only owner of the device across the mode
//! switch.

pub mod bootstrap;
pub mod command;

pub use {
    bootstrap::{BootstrapEngine, BootstrapState, DeviceInfo},
    command::{CommandEngine, CommandState, Negotiated, StorageInfo},
};
