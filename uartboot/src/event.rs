//! Notifications delivered to the presentation layer.
//!
//! Every operation produces an ordered stream of [`Event`]s ending with
//! exactly one [`Event::Finished`].

use {
    crate::{
        error::{Error, ErrorKind},
        flasher::FlashSummary,
        protocol::BootloaderInfo,
    },
    std::{fmt, sync::mpsc::Sender},
};

/// One notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Progress of a flash write, 0 to 100.
    Progress(u8),
    /// Human readable status line.
    Status(String),
    /// Bytes written to the transport, exactly as sent.
    Tx(Vec<u8>),
    /// Bytes received from the transport.
    Rx(Vec<u8>),
    /// Terminal outcome of the operation.
    Finished(Outcome),
}

/// Terminal result of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed.
    Succeeded(Report),
    /// The operation failed; nothing further was attempted.
    Failed(Failure),
}

impl Outcome {
    /// Whether the operation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// The report, if the operation succeeded.
    pub fn report(&self) -> Option<&Report> {
        match self {
            Self::Succeeded(report) => Some(report),
            Self::Failed(_) => None,
        }
    }

    /// The failure, if the operation failed.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }
}

/// What a successful operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// GET_INFO result.
    Info(BootloaderInfo),
    /// Firmware written.
    Flashed(FlashSummary),
    /// Flash contents read back.
    Read {
        /// Start address.
        address: u32,
        /// Bytes returned by the device.
        data: Vec<u8>,
    },
    /// Region erased.
    Erased {
        /// Start address.
        address: u32,
        /// Size in bytes.
        size: u32,
    },
    /// Region checksum.
    Checksum {
        /// Start address.
        address: u32,
        /// Size in bytes.
        size: u32,
        /// Checksum reported by the device.
        value: u32,
    },
    /// Device acknowledged the jump to the application.
    Jumped,
}

/// Why an operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human readable cause.
    pub message: String,
}

impl From<&Error> for Failure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Sending half of a notification stream.
///
/// Emitting never fails: once the receiver is gone, events are dropped.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<Sender<Event>>,
}

impl EventSink {
    /// Sink delivering into `sender`.
    pub fn new(sender: Sender<Event>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Sink that discards everything.
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Deliver one event.
    pub fn emit(&self, event: Event) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    /// Deliver a status line.
    pub fn status(&self, message: impl Into<String>) {
        self.emit(Event::Status(message.into()));
    }

    /// Deliver a progress value.
    pub fn progress(&self, percent: u8) {
        self.emit(Event::Progress(percent));
    }
}
