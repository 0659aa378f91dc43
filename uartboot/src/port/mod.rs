//! Port abstraction for the byte-oriented serial transport.
//!
//! The protocol engine never talks to an operating system port directly. It
//! drives anything implementing [`Port`]:
//!
//! - **Native platforms** (Linux, macOS, Windows): [`NativePort`] over the
//!   `serialport` crate
//! - **Tests**: a simulated bootloader device
//!
//! ```text
//! +------------------+
//! |  Session / Flash |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |   LinkChannel    |   synchronize / write / read
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |    Port trait    |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! Device enumeration and baud/parity setup are performed here, outside of
//! the protocol engine.

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod sim;

use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Baud rates accepted by the bootloader link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BaudRate {
    /// 9600 baud.
    B9600,
    /// 19200 baud.
    B19200,
    /// 38400 baud.
    B38400,
    /// 57600 baud.
    B57600,
    /// 115200 baud.
    #[default]
    B115200,
    /// 230400 baud.
    B230400,
}

impl BaudRate {
    /// All supported rates, slowest first.
    pub const ALL: [Self; 6] = [
        Self::B9600,
        Self::B19200,
        Self::B38400,
        Self::B57600,
        Self::B115200,
        Self::B230400,
    ];

    /// Numeric rate in bits per second.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            Self::B9600 => 9600,
            Self::B19200 => 19200,
            Self::B38400 => 38400,
            Self::B57600 => 57600,
            Self::B115200 => 115_200,
            Self::B230400 => 230_400,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|rate| rate.as_u32() == value)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unsupported baud rate {value} (expected one of 9600, 19200, 38400, 57600, 115200, 230400)"
                ))
            })
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Link configuration.
///
/// Framing is always 8 data bits, no parity, 1 stop bit and no flow control.
/// The value is fixed once a link has been opened with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: BaudRate,
    /// Base read timeout; protocol phases override it per read.
    pub timeout: Duration,
}

impl LinkConfig {
    /// Default base read timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: BaudRate) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Set the base read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Which transport buffer to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Bytes received but not yet read.
    Input,
    /// Bytes queued but not yet transmitted.
    Output,
    /// Both directions.
    All,
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Short human readable description, e.g. "USB (1A86:7523) USB Serial".
    pub fn description(&self) -> String {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => {
                let product = self.product.as_deref().unwrap_or("");
                format!("USB ({vid:04X}:{pid:04X}) {product}")
                    .trim_end()
                    .to_string()
            },
            _ => "serial".to_string(),
        }
    }
}

/// Byte transport driven by the link channel.
pub trait Port: Read + Write + Send {
    /// Set the read timeout used by the next blocking read.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Discard buffered bytes in the given direction.
    fn clear_buffers(&mut self, which: BufferKind) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Whether the port is still open.
    fn is_open(&self) -> bool;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    /// Closing an already closed port is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until they are flushed.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Trait for listing available serial ports.
///
/// Separate from `Port` because it does not need an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Find ports matching the given VID/PID.
    fn find_by_vid_pid(vid: u16, pid: u16) -> Result<Vec<PortInfo>> {
        let ports = Self::list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| p.vid == Some(vid) && p.pid == Some(pid))
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
