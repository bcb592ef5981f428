//! Port abstraction for the TKey serial transport.
//!
//! The TKey enumerates as a USB CDC-ACM device. The session layer only needs
//! a byte stream with a read timeout and an explicit close, so everything
//! above this module is written against the [`Port`] trait:
//!
//! ```text
//! +--------------------+
//! |  Provisioner       |
//! +---------+----------+
//!           |
//! +---------v----------+
//! |  DeviceSession     |  frames, timeouts, reset/reconnect
//! +---------+----------+
//!           |
//! +---------v----------+     +--------------------+
//! |  Port trait        +---->|  NativePort        |  serialport crate
//! +--------------------+     +--------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use tkeymgt::port::Port;
//!
//! fn ping<P: Port>(port: &mut P) -> tkeymgt::Result<()> {
//!     port.write_all_bytes(&[0x1d, 0x01])?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use {
    crate::error::Result,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Serial speed the TKey firmware and apps talk at.
pub const TKEY_BAUD: u32 = 62_500;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout of a single I/O call.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: TKEY_BAUD,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration for the given port at TKey speed.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte transport to a TKey.
///
/// A read that hits the configured timeout must fail with
/// [`std::io::ErrorKind::TimedOut`] (or `WouldBlock`); any other error, or a
/// read returning `Ok(0)`, is taken to mean the transport went away.
pub trait Port: Read + Write + Send {
    /// Set the timeout of a single read/write call.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release the OS handle.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    /// Calling it twice is harmless.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default_is_tkey_speed() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 62_500);
        assert_eq!(config.timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyACM0")
            .with_baud_rate(115_200)
            .with_timeout(Duration::from_secs(1));
        assert_eq!(config.port_name, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.timeout, Duration::from_secs(1));
    }
}
