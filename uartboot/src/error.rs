//! Error types for uartboot.

use std::{fmt, io, path::PathBuf};
use thiserror::Error;

/// Result type for uartboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for uartboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport unavailable, closed, or an open/write was refused.
    #[error("Link error: {0}")]
    Link(String),

    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Response status byte mismatched, or the response was malformed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Expected bytes did not arrive within the bounded wait.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Firmware image could not be read.
    #[error("Cannot read firmware file {}: {source}", path.display())]
    File {
        /// Path of the file that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Another operation is already running on this session.
    #[error("Busy: an operation is already running")]
    Busy,

    /// Request parameters were rejected before any traffic was sent.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was cancelled by the requester.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

/// Coarse error classification used when reporting outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ErrorKind {
    /// Transport level failure.
    Link,
    /// Unexpected or malformed response.
    Protocol,
    /// Response did not arrive in time.
    Timeout,
    /// Firmware file unreadable.
    File,
    /// Synchronous rejection (busy or invalid request).
    Rejected,
    /// Cancelled by the requester.
    Cancelled,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Link(_) | Self::Io(_) => ErrorKind::Link,
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorKind::Link,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::File { .. } => ErrorKind::File,
            Self::Busy | Self::InvalidArgument(_) => ErrorKind::Rejected,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link => write!(f, "link"),
            Self::Protocol => write!(f, "protocol"),
            Self::Timeout => write!(f, "timeout"),
            Self::File => write!(f, "file"),
            Self::Rejected => write!(f, "rejected"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
