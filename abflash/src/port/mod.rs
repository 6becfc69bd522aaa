//! Port abstraction for the device's serial console.
//!
//! The console layer only needs a byte pipe with a configurable read
//! timeout, so the `Port` trait is kept small:
//!
//! ```text
//! +------------------+
//! |  Shell / SSH     |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | SerialConsole<P> |   (expect, before-text, drain)
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |   Port trait     |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |   NativePort     |
//! |   (serialport)   |
//! +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial console configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout of a single poll on the port.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the poll timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte-level port the console is attached to.
///
/// A read that finds no data within the configured timeout returns an
/// `io::ErrorKind::TimedOut` error (or `Ok(0)`), never blocks forever.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
