//! Wire formats spoken by the device.
//!
//! - [`sahara`]: binary frames used by the boot ROM to identify itself and
//!   pull the loader
//! - [`firehose`]: enveloped XML documents understood by the loader

pub mod firehose;
pub mod sahara;

pub use {
    firehose::{PowerAction, Request, Response, SectorRange, Status, StorageType},
    sahara::{Mode, Packet},
};
