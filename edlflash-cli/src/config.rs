//! Configuration files for edlflash.
//!
//! Sources, highest priority first:
//! 1. Command-line arguments and `EDLFLASH_*` environment variables
//! 2. `--config PATH`, when given (replaces 3 and 4)
//! 3. Local `./edlflash.toml`, with ports from `./edlflash_ports.toml`
//! 4. Global `config.toml` / `ports.toml` in the platform config directory

use {
    directories::ProjectDirs,
    log::{debug, info, warn},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

const LOCAL_CONFIG: &str = "edlflash.toml";
const LOCAL_PORTS: &str = "edlflash_ports.toml";

/// USB vendor/product pair that should be treated as an EDL endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g. "/dev/ttyUSB0" or "COM7").
    pub serial: Option<String>,
}

/// Port settings, also stored on their own in the ports file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Extra USB IDs accepted during port selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Session defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSection {
    /// Loader image uploaded to the boot ROM.
    pub loader: Option<PathBuf>,
    /// Storage type name (emmc, ufs, nand, nvme, spinor).
    pub memory: Option<String>,
    pub sector_size: Option<usize>,
    pub max_payload: Option<usize>,
    /// Physical partition (LUN).
    pub lun: Option<u32>,
    /// Boot partition selected after `flash`.
    pub active_partition: Option<u32>,
    #[serde(default)]
    pub skip_write: bool,
    #[serde(default)]
    pub skip_storage_init: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub port: PortConfig,
    #[serde(default)]
    pub session: SessionSection,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global) = Self::global_config_path().and_then(|p| read_toml::<Self>(&p)) {
            debug!("Loaded global config");
            config.merge(global);
        }
        if let Some(local) = read_toml::<Self>(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local);
        }
        if let Some(ports) = Self::load_ports_config() {
            config.port = ports;
        }

        config
    }

    /// Load configuration from an explicit `--config` path.
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = read_toml(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_ports_config() -> Option<PortConfig> {
        read_toml(Path::new(LOCAL_PORTS)).or_else(|| {
            Self::global_config_dir().and_then(|dir| read_toml(&dir.join("ports.toml")))
        })
    }

    /// Platform configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "edlflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Global configuration file.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Overlay `other` on top of `self`.
    fn merge(&mut self, other: Self) {
        if other.port.connection.serial.is_some() {
            self.port.connection.serial = other.port.connection.serial;
        }
        self.port.usb_device.extend(other.port.usb_device);

        let s = other.session;
        if s.loader.is_some() {
            self.session.loader = s.loader;
        }
        if s.memory.is_some() {
            self.session.memory = s.memory;
        }
        if s.sector_size.is_some() {
            self.session.sector_size = s.sector_size;
        }
        if s.max_payload.is_some() {
            self.session.max_payload = s.max_payload;
        }
        if s.lun.is_some() {
            self.session.lun = s.lun;
        }
        if s.active_partition.is_some() {
            self.session.active_partition = s.active_partition;
        }
        self.session.skip_write |= s.skip_write;
        self.session.skip_storage_init |= s.skip_storage_init;
    }

    /// Remember a USB ID so the port is auto-selected next time.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port.usb_device.push(device);
        fs::write(&path, toml::to_string_pretty(&self.port)?)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)
            .map_err(|e| warn!("Failed to parse config file {}: {e}", path.display()))
            .ok(),
        Err(e) => {
            warn!("Failed to read config file {}: {e}", path.display());
            None
        },
    }
}
