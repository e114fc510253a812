//! Serial transport using the `serialport` crate.
//!
//! On Linux the EDL interface shows up as `/dev/ttyUSBn` through the
//! `qcserial` driver, on Windows as a QDLoader COM port. Line settings are
//! irrelevant for a USB CDC pipe, but the OS still wants a baud rate.

use {
    crate::{
        error::{Error, Result, TransportError},
        transport::{RetryPolicy, Transport, classify_io},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Nominal baud rate for the CDC pipe.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Writes are split at this size; matches the usbfs bulk limit.
pub const SERIAL_MAX_TRANSFER: usize = 16 * 1024;

/// Serial transport configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate handed to the OS.
    pub baud_rate: u32,
    /// Default I/O timeout.
    pub timeout: Duration,
    /// Policy for opening and reopening the port.
    pub open_retry: RetryPolicy,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_secs(5),
            open_retry: RetryPolicy::default(),
        }
    }
}

impl SerialConfig {
    /// Create a configuration for the given port.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the default I/O timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the open/reopen retry policy.
    #[must_use]
    pub fn with_open_retry(mut self, retry: RetryPolicy) -> Self {
        self.open_retry = retry;
        self
    }
}

/// EDL device reached through a serial port.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    config: SerialConfig,
    current_timeout: Duration,
}

impl SerialTransport {
    /// Open the port, retrying per the configured policy.
    pub fn open(config: SerialConfig) -> Result<Self> {
        let port = Self::open_port(&config)?;
        Ok(Self {
            port: Some(port),
            current_timeout: config.timeout,
            config,
        })
    }

    fn open_port(config: &SerialConfig) -> Result<Box<dyn serialport::SerialPort>> {
        config
            .open_retry
            .run(&format!("Opening {}", config.port_name), |_| {
                serialport::new(&config.port_name, config.baud_rate)
                    .timeout(config.timeout)
                    .open()
                    .map_err(|e| map_serial_error(e, &config.port_name))
            })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or(Error::Transport(TransportError::Disconnected))
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.current_timeout != timeout {
            self.port_mut()?
                .set_timeout(timeout)?;
            self.current_timeout = timeout;
        }
        Ok(())
    }
}

fn map_serial_error(err: serialport::Error, name: &str) -> Error {
    match err.kind() {
        serialport::ErrorKind::NoDevice => TransportError::NotFound(name.to_string()).into(),
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::NotFound(name.to_string()).into()
        },
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::Busy(format!("{name}: {err}")).into()
        },
        _ => Error::Serial(err),
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let timeout = self.config.timeout;
        self.apply_timeout(timeout)?;
        let port = self.port_mut()?;

        for chunk in data.chunks(SERIAL_MAX_TRANSFER) {
            port.write_all(chunk)
                .map_err(|e| classify_io(&e, timeout))?;
        }
        port.flush()
            .map_err(|e| classify_io(&e, timeout))?;

        trace!("Sent {} bytes", data.len());
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.apply_timeout(timeout)?;
        match self
            .port_mut()?
            .read(buf)
        {
            Ok(0) => Err(TransportError::Timeout(timeout.as_millis()).into()),
            Ok(n) => {
                trace!("Received {n} bytes");
                Ok(n)
            },
            Err(e) => Err(classify_io(&e, timeout)),
        }
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn max_transfer_unit(&self) -> usize {
        SERIAL_MAX_TRANSFER
    }

    fn close(&mut self) -> Result<()> {
        if self
            .port
            .take()
            .is_some()
        {
            debug!("Closed {}", self.config.port_name);
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.close()?;
        let port = Self::open_port(&self.config)?;
        self.port = Some(port);
        self.current_timeout = self.config.timeout;
        debug!("Reopened {}", self.config.port_name);
        Ok(())
    }

    fn is_present(&self) -> bool {
        serialport::available_ports().is_ok_and(|ports| {
            ports
                .iter()
                .any(|p| p.port_name == self.config.port_name)
        })
    }
}
