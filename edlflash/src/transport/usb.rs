//! Direct USB transport using `rusb`.
//!
//! Talks to the vendor-specific bulk interface of a device enumerated as
//! 05C6:9008, bypassing any kernel serial driver.

use {
    crate::{
        error::{Error, Result, TransportError},
        transport::{RetryPolicy, Transport},
    },
    log::{debug, trace},
    rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext},
    std::time::Duration,
};

/// Qualcomm USB vendor ID.
pub const QUALCOMM_VID: u16 = 0x05C6;

/// Product ID of the EDL (QDLoader 9008) interface.
pub const EDL_PID: u16 = 0x9008;

/// Largest bulk transfer usbfs accepts in one call.
pub const USB_MAX_TRANSFER: usize = 16 * 1024;

/// USB transport configuration.
#[derive(Debug, Clone)]
pub struct UsbConfig {
    /// Vendor ID to look for.
    pub vid: u16,
    /// Product ID to look for.
    pub pid: u16,
    /// Default bulk timeout.
    pub timeout: Duration,
    /// Policy for claiming the interface.
    pub claim_retry: RetryPolicy,
    /// Policy for failed (non-timeout) bulk reads.
    pub read_retry: RetryPolicy,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vid: QUALCOMM_VID,
            pid: EDL_PID,
            timeout: Duration::from_secs(5),
            claim_retry: RetryPolicy::new(10, Duration::from_millis(100)),
            read_retry: RetryPolicy::new(10, Duration::from_millis(200)),
        }
    }
}

impl UsbConfig {
    /// Match a specific VID/PID pair.
    #[must_use]
    pub fn with_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = vid;
        self.pid = pid;
        self
    }

    /// Set the default bulk timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Endpoints {
    config: u8,
    iface: u8,
    setting: u8,
    bulk_in: u8,
    bulk_out: u8,
}

/// EDL device reached through raw USB bulk endpoints.
pub struct UsbTransport {
    context: Context,
    handle: Option<DeviceHandle<Context>>,
    endpoints: Option<Endpoints>,
    config: UsbConfig,
    name: String,
}

impl UsbTransport {
    /// Find the device and claim its bulk interface.
    pub fn open(config: UsbConfig) -> Result<Self> {
        let context = Context::new()?;
        let mut transport = Self {
            context,
            handle: None,
            endpoints: None,
            name: format!("usb:{:04x}:{:04x}", config.vid, config.pid),
            config,
        };
        transport.attach()?;
        Ok(transport)
    }

    fn find_device(&self) -> Result<Device<Context>> {
        for device in self
            .context
            .devices()?
            .iter()
        {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() == self.config.vid && desc.product_id() == self.config.pid {
                return Ok(device);
            }
        }
        Err(TransportError::NotFound(self.name.clone()).into())
    }

    fn find_endpoints(device: &Device<Context>) -> Option<Endpoints> {
        let desc = device
            .device_descriptor()
            .ok()?;
        for n in 0..desc.num_configurations() {
            let Ok(config_desc) = device.config_descriptor(n) else {
                continue;
            };

            for iface in config_desc.interfaces() {
                for iface_desc in iface.descriptors() {
                    let mut bulk_in = None;
                    let mut bulk_out = None;
                    for ep in iface_desc.endpoint_descriptors() {
                        if ep.transfer_type() != TransferType::Bulk {
                            continue;
                        }
                        match ep.direction() {
                            Direction::In => bulk_in = Some(ep.address()),
                            Direction::Out => bulk_out = Some(ep.address()),
                        }
                    }
                    if let (Some(bulk_in), Some(bulk_out)) = (bulk_in, bulk_out) {
                        return Some(Endpoints {
                            config: config_desc.number(),
                            iface: iface_desc.interface_number(),
                            setting: iface_desc.setting_number(),
                            bulk_in,
                            bulk_out,
                        });
                    }
                }
            }
        }
        None
    }

    fn attach(&mut self) -> Result<()> {
        let device = self.find_device()?;
        let endpoints = Self::find_endpoints(&device).ok_or_else(|| {
            Error::Unsupported(format!("{} exposes no bulk IN/OUT pair", self.name))
        })?;

        self.name = format!(
            "usb:{:03}:{:03}",
            device.bus_number(),
            device.address()
        );

        let mut handle = device
            .open()
            .map_err(|e| map_usb_error(e, &self.name))?;
        // Not supported on every platform; claiming still works without it.
        let _ = handle.set_auto_detach_kernel_driver(true);

        let name = self.name.clone();
        self.config
            .claim_retry
            .run(&format!("Claiming interface on {name}"), |_| {
                handle
                    .claim_interface(endpoints.iface)
                    .map_err(|e| map_usb_error(e, &name))
            })?;
        if endpoints.setting != 0 {
            handle
                .set_alternate_setting(endpoints.iface, endpoints.setting)
                .map_err(|e| map_usb_error(e, &name))?;
        }

        debug!(
            "Claimed {} (config {}, interface {}, in 0x{:02x}, out 0x{:02x})",
            self.name, endpoints.config, endpoints.iface, endpoints.bulk_in, endpoints.bulk_out
        );

        self.handle = Some(handle);
        self.endpoints = Some(endpoints);
        Ok(())
    }

    fn io(&self) -> Result<(&DeviceHandle<Context>, Endpoints)> {
        match (&self.handle, self.endpoints) {
            (Some(handle), Some(endpoints)) => Ok((handle, endpoints)),
            _ => Err(TransportError::Disconnected.into()),
        }
    }
}

fn map_usb_error(err: rusb::Error, name: &str) -> Error {
    match err {
        rusb::Error::Timeout => TransportError::Timeout(0).into(),
        rusb::Error::NoDevice => TransportError::Disconnected.into(),
        rusb::Error::NotFound => TransportError::NotFound(name.to_string()).into(),
        rusb::Error::Busy | rusb::Error::Access => {
            TransportError::Busy(format!("{name}: {err}")).into()
        },
        other => Error::Usb(other),
    }
}

impl Transport for UsbTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let timeout = self.config.timeout;
        let (handle, endpoints) = self.io()?;

        let mut sent = 0;
        while sent < data.len() {
            let end = (sent + USB_MAX_TRANSFER).min(data.len());
            let n = handle
                .write_bulk(endpoints.bulk_out, &data[sent..end], timeout)
                .map_err(|e| match e {
                    rusb::Error::Timeout => TransportError::Timeout(timeout.as_millis()).into(),
                    other => map_usb_error(other, &self.name),
                })?;
            if n == 0 {
                return Err(TransportError::Failed(format!(
                    "bulk write stalled after {sent} of {} bytes",
                    data.len()
                ))
                .into());
            }
            sent += n;
        }

        trace!("Sent {sent} bytes");
        Ok(sent)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let (handle, endpoints) = self.io()?;
        let len = buf.len().min(USB_MAX_TRANSFER);
        let name = &self.name;

        let n = self.config.read_retry.run_if(
            "Bulk read",
            |e| !e.is_timeout() && !matches!(e, Error::Transport(TransportError::Disconnected)),
            |_| match handle.read_bulk(endpoints.bulk_in, &mut buf[..len], timeout) {
                Ok(0) => Err(TransportError::Failed("zero-length read".into()).into()),
                Ok(n) => Ok(n),
                Err(rusb::Error::Timeout) => {
                    Err(TransportError::Timeout(timeout.as_millis()).into())
                },
                Err(e) => Err(map_usb_error(e, name)),
            },
        )?;

        trace!("Received {n} bytes");
        Ok(n)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let (Some(handle), Some(endpoints)) = (self.handle.as_mut(), self.endpoints) {
            let _ = handle.clear_halt(endpoints.bulk_in);
            let _ = handle.clear_halt(endpoints.bulk_out);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn max_transfer_unit(&self) -> usize {
        USB_MAX_TRANSFER
    }

    fn close(&mut self) -> Result<()> {
        if let (Some(mut handle), Some(endpoints)) = (self.handle.take(), self.endpoints.take()) {
            let _ = handle.release_interface(endpoints.iface);
            debug!("Released {}", self.name);
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.close()?;
        self.attach()
    }

    fn is_present(&self) -> bool {
        self.find_device()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_config_defaults_match_edl() {
        let config = UsbConfig::default();
        assert_eq!(config.vid, 0x05C6);
        assert_eq!(config.pid, 0x9008);
        assert_eq!(config.claim_retry.attempts, 10);
        assert_eq!(config.read_retry.delay, Duration::from_millis(200));
    }

    #[test]
    fn test_usb_error_mapping() {
        assert!(map_usb_error(rusb::Error::Timeout, "x").is_timeout());
        assert!(matches!(
            map_usb_error(rusb::Error::NoDevice, "x"),
            Error::Transport(TransportError::Disconnected)
        ));
        assert!(matches!(
            map_usb_error(rusb::Error::Busy, "x"),
            Error::Transport(TransportError::Busy(_))
        ));
    }
}
