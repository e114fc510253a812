//! Session configuration and the mutable facts learned during a session.

use {
    crate::{
        engine::bootstrap::DeviceInfo,
        protocol::firehose::{DEFAULT_MAX_XML_SIZE, StorageType},
        transport::RetryPolicy,
    },
    std::{fmt, time::Duration},
};

/// Payload size requested in `configure` unless overridden.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Protocol currently spoken to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Protocol {
    /// Boot ROM bootstrap protocol.
    Bootstrap,
    /// XML command protocol served by the loader.
    Command,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// Boot mode of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceMode {
    /// Booted normally (diagnostic interface only).
    Normal,
    /// Emergency download.
    #[default]
    Emergency,
}

/// Deadlines for the various waits of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for the boot ROM greeting.
    pub hello: Duration,
    /// Waiting for an XML response or bootstrap frame.
    pub response: Duration,
    /// Waiting for each raw data chunk.
    pub data: Duration,
    /// Waiting for the device to drop off the bus after the loader handoff.
    pub disconnect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            hello: Duration::from_secs(5),
            response: Duration::from_secs(5),
            data: Duration::from_secs(10),
            disconnect: Duration::from_secs(5),
        }
    }
}

/// Immutable parameters of one device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Storage technology behind the loader.
    pub memory: StorageType,
    /// Sector size override; `None` uses the storage default.
    pub sector_size: Option<usize>,
    /// Payload size requested during negotiation.
    pub max_payload: usize,
    /// Largest XML document accepted from the device.
    pub max_xml_size: usize,
    /// Ask the loader for verbose logs.
    pub verbose: bool,
    /// Loader accepts writes without committing them.
    pub skip_write: bool,
    /// Loader skips storage initialisation.
    pub skip_storage_init: bool,
    /// Host copes with zero-length packets.
    pub zlp_aware: bool,
    /// Physical partition (LUN) addressed by range operations.
    pub partition: u32,
    /// Boot partition to select after a batch, if any.
    pub active_partition: Option<u32>,
    /// Query serial number, hardware ID and key hash before the upload.
    pub identify: bool,
    /// Deadlines.
    pub timeouts: Timeouts,
    /// Policy for reopening the transport after re-enumeration.
    pub reopen_retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(StorageType::default())
    }
}

impl SessionConfig {
    /// Configuration for the given storage type with stock defaults.
    #[must_use]
    pub fn new(memory: StorageType) -> Self {
        Self {
            memory,
            sector_size: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_xml_size: DEFAULT_MAX_XML_SIZE,
            verbose: false,
            skip_write: false,
            skip_storage_init: false,
            zlp_aware: true,
            partition: 0,
            active_partition: None,
            identify: true,
            timeouts: Timeouts::default(),
            reopen_retry: RetryPolicy::new(10, Duration::from_millis(500)),
        }
    }

    /// Effective sector size.
    #[must_use]
    pub fn sector_size(&self) -> usize {
        self.sector_size
            .unwrap_or_else(|| {
                self.memory
                    .default_sector_size()
            })
    }

    /// Override the sector size.
    #[must_use]
    pub fn with_sector_size(mut self, sector_size: usize) -> Self {
        self.sector_size = Some(sector_size);
        self
    }

    /// Set the payload size to request.
    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Select the physical partition (LUN).
    #[must_use]
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = partition;
        self
    }

    /// Select a boot partition to activate after a batch.
    #[must_use]
    pub fn with_active_partition(mut self, partition: Option<u32>) -> Self {
        self.active_partition = partition;
        self
    }

    /// Enable or disable the loader's verbose logging.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Ask the loader to accept but not commit writes.
    #[must_use]
    pub fn with_skip_write(mut self, skip: bool) -> Self {
        self.skip_write = skip;
        self
    }

    /// Ask the loader to skip storage initialisation.
    #[must_use]
    pub fn with_skip_storage_init(mut self, skip: bool) -> Self {
        self.skip_storage_init = skip;
        self
    }

    /// Enable or disable the identity query.
    #[must_use]
    pub fn with_identify(mut self, identify: bool) -> Self {
        self.identify = identify;
        self
    }

    /// Replace the deadlines.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Replace the reopen policy.
    #[must_use]
    pub fn with_reopen_retry(mut self, policy: RetryPolicy) -> Self {
        self.reopen_retry = policy;
        self
    }
}

/// What the session has learned about the device so far.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SessionState {
    /// Protocol currently spoken, if connected.
    pub protocol: Option<Protocol>,
    /// Boot mode.
    pub mode: DeviceMode,
    /// Payload size granted by the loader.
    pub max_payload: Option<usize>,
    /// Sector size in use.
    pub sector_size: usize,
    /// Boot partition last selected.
    pub active_partition: Option<u32>,
    /// Identity read from the boot ROM.
    pub device_info: Option<DeviceInfo>,
}

impl SessionState {
    /// Fresh state for a configuration.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sector_size: config.sector_size(),
            ..Self::default()
        }
    }

    /// Forget everything learned from the device.
    pub fn reset(&mut self) {
        self.protocol = None;
        self.max_payload = None;
    }
}
