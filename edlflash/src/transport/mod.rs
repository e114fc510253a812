//! Byte-stream transports to a device in EDL mode.
//!
//! Both protocol engines talk to the device through the [`Transport`] trait
//! and never touch the OS handle directly. Two implementations exist:
//!
//! - **Serial** (`native`, default): the `qcserial` / QDLoader presentation of
//!   the EDL interface, via the `serialport` crate
//! - **USB** (`usb`): raw bulk endpoints via `rusb`
//!
//! ```text
//! +-------------------+   +-------------------+
//! |  Bootstrap engine |   |  Command engine   |
//! +---------+---------+   +---------+---------+
//!           |                       |
//!           v                       v
//! +---------+-----------------------+---------+
//! |              Transport trait              |
//! +---------+-----------------------+---------+
//!           |                       |
//! +---------+---------+   +---------+---------+
//! |  SerialTransport  |   |   UsbTransport    |
//! |   (serialport)    |   |      (rusb)       |
//! +-------------------+   +-------------------+
//! ```

#[cfg(feature = "native")]
pub mod serial;

#[cfg(feature = "usb")]
pub mod usb;

use {
    crate::error::{Error, Result},
    log::{debug, warn},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

/// Interval between presence checks in [`Transport::wait_for_disconnect`].
pub const PRESENCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded retry with a fixed delay between attempts.
///
/// Used for opening and claiming the device and for short reads at the
/// transport layer. Protocol exchanges are never retried through this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts (at least one is always made).
    pub attempts: usize,
    /// Sleep between consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// The closure receives the 1-based attempt number. The last error is
    /// returned when every attempt fails.
    pub fn run<T, F>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut(usize) -> Result<T>,
    {
        self.run_if(what, |_| true, op)
    }

    /// Like [`RetryPolicy::run`], but only errors accepted by `retryable`
    /// are retried; anything else is returned immediately.
    pub fn run_if<T, F, P>(&self, what: &str, retryable: P, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Result<T>,
        P: Fn(&Error) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{what} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                },
                Err(e) if attempt < attempts && retryable(&e) => {
                    warn!("{what} failed (attempt {attempt}/{attempts}): {e}");
                    thread::sleep(self.delay);
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Blocking byte pipe to one device.
///
/// `send` and `receive` either move the full request or fail; partial
/// completion is never reported as success. Implementations chunk large
/// transfers to [`Transport::max_transfer_unit`] internally.
pub trait Transport: Send {
    /// Send every byte of `data`, returning the number written.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Receive at least one byte into `buf`, waiting up to `timeout`.
    ///
    /// Returns `TransportError::Timeout` if nothing arrived in time.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Fill `buf` completely, each underlying receive bounded by `timeout`.
    fn receive_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.receive(&mut buf[filled..], timeout)?;
        }
        Ok(())
    }

    /// Drop any bytes buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Endpoint name for messages (port path or bus address).
    fn name(&self) -> &str;

    /// Largest single OS-level transfer.
    fn max_transfer_unit(&self) -> usize;

    /// Release the OS handle. Further I/O fails until [`Transport::reopen`].
    fn close(&mut self) -> Result<()>;

    /// Acquire the OS handle again, e.g. after the device re-enumerated.
    fn reopen(&mut self) -> Result<()>;

    /// Whether the device is currently visible to the host.
    fn is_present(&self) -> bool;

    /// Poll presence until the device disappears or `timeout` elapses.
    ///
    /// Returns `false` if the device is still present after the timeout.
    fn wait_for_disconnect(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_present() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(PRESENCE_POLL_INTERVAL);
        }
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).receive(buf, timeout)
    }

    fn receive_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        (**self).receive_exact(buf, timeout)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn max_transfer_unit(&self) -> usize {
        (**self).max_transfer_unit()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn reopen(&mut self) -> Result<()> {
        (**self).reopen()
    }

    fn is_present(&self) -> bool {
        (**self).is_present()
    }

    fn wait_for_disconnect(&mut self, timeout: Duration) -> bool {
        (**self).wait_for_disconnect(timeout)
    }
}

/// Map an I/O error from a device handle into the transport taxonomy.
pub(crate) fn classify_io(err: &std::io::Error, timeout: Duration) -> Error {
    use {crate::error::TransportError, std::io::ErrorKind};

    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            TransportError::Timeout(timeout.as_millis()).into()
        },
        ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
            TransportError::Disconnected.into()
        },
        ErrorKind::NotFound => TransportError::NotFound(err.to_string()).into(),
        ErrorKind::PermissionDenied => TransportError::Busy(err.to_string()).into(),
        _ => TransportError::Failed(err.to_string()).into(),
    }
}
