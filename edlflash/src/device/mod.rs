//! Device discovery and classification.
//!
//! Serial enumeration is used for discovery on every platform; the USB
//! transport looks the device up by VID/PID on its own.

use crate::error::{Error, Result, TransportError};

#[cfg(feature = "native")]
use log::{debug, info, trace, warn};

/// Qualcomm USB vendor ID.
pub const QUALCOMM_VID: u16 = 0x05C6;

/// Transport type for discovered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransportKind {
    /// Serial presentation (qcserial, QDLoader COM port).
    Serial,
    /// Raw USB bulk endpoints.
    Usb,
    /// Unknown or unclassified transport.
    Unknown,
}

/// What a discovered endpoint most likely is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum DeviceKind {
    /// Boot ROM in Emergency Download mode (QDLoader 9008).
    QualcommEdl,
    /// Diagnostic composite interface of a booted device.
    QualcommDiag,
    /// Other Qualcomm USB function.
    Qualcomm,
    /// Unknown device.
    Unknown,
}

/// Known Qualcomm product IDs. An empty list matches every PID.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (QUALCOMM_VID, &[0x9008], DeviceKind::QualcommEdl),
    (
        QUALCOMM_VID,
        &[0x900E, 0x9025, 0x9091, 0x90DB, 0x901D],
        DeviceKind::QualcommDiag,
    ),
    (QUALCOMM_VID, &[], DeviceKind::Qualcomm),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::QualcommEdl => "Qualcomm EDL (9008)",
            Self::QualcommDiag => "Qualcomm diagnostic",
            Self::Qualcomm => "Qualcomm",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether the boot ROM is waiting for the bootstrap protocol.
    pub fn is_emergency_download(&self) -> bool {
        matches!(self, Self::QualcommEdl)
    }
}

/// Discovered device endpoint information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Transport type.
    pub transport: TransportKind,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Check if this endpoint is a device in EDL mode.
    pub fn is_edl(&self) -> bool {
        self.device
            .is_emergency_download()
    }
}

/// Detect all available endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info
                        .port_name
                        .clone(),
                    transport: TransportKind::Serial,
                    device: DeviceKind::Unknown,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Detect all available endpoints (no serial support compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best EDL endpoint from a list of candidates.
pub fn select_edl_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    let mut fallback = None;
    for port in ports {
        if port.is_edl() {
            return Ok(port);
        }
        if port.device == DeviceKind::QualcommDiag && fallback.is_none() {
            fallback = Some(port);
        }
    }

    match fallback {
        Some(port) => Err(Error::Unsupported(format!(
            "{} is a booted device ({}); reboot it into EDL mode first",
            port.name,
            port.device.name()
        ))),
        None => Err(TransportError::NotFound("no device in EDL mode".into()).into()),
    }
}

/// Auto-detect a single EDL endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_edl_port(detect_ports()).inspect_err(|e| warn!("Auto-detection: {e}"))?;
    info!("Auto-detected {}: {}", port.device.name(), port.name);
    Ok(port)
}

/// Auto-detect a single EDL endpoint (no serial support compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "Serial auto-detection requires the `native` feature".to_string(),
    ))
}
