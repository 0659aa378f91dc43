//! # uartboot
//!
//! A library for driving a UART command/response MCU bootloader.
//!
//! This crate provides the host side of the bootloader protocol:
//!
//! - Command codec with split-frame transmission
//! - Buffer-synchronized link over a serial port
//! - Chunked flash programming with progress and cancellation
//! - A single-flight session that runs operations off the caller's thread
//!
//! ## Supported Operations
//!
//! - `GET_INFO`: bootloader version and application address
//! - `ERASE_FLASH`, `WRITE_FLASH`, `READ_FLASH`
//! - `GET_CHECKSUM`: region checksum, also used to verify a flash write
//! - `JUMP_TO_APP`
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for reports and data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use uartboot::{BaudRate, Event, FirmwareImage, FlashOptions, LinkChannel, LinkConfig, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("app.bin")?;
//!
//!     let config = LinkConfig::new("/dev/ttyUSB0", BaudRate::B115200);
//!     let (session, events) = Session::new(LinkChannel::open(&config)?);
//!
//!     session.flash_firmware(image.into_data(), 0x0800_8000, FlashOptions::default())?;
//!     for event in events {
//!         match event {
//!             Event::Progress(percent) => println!("{percent}%"),
//!             Event::Status(line) => println!("{line}"),
//!             Event::Finished(outcome) => {
//!                 println!("success: {}", outcome.is_success());
//!                 break;
//!             },
//!             _ => {},
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootloader;
pub mod error;
pub mod event;
pub mod flasher;
pub mod image;
pub mod link;
pub mod port;
pub mod protocol;
pub mod session;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    bootloader::Bootloader,
    error::{Error, ErrorKind, Result},
    event::{Event, EventSink, Failure, Outcome, Report},
    flasher::{
        CHUNK_SIZE, Chunk, FlashOptions, FlashProgrammer, FlashState, FlashSummary, FlashWriteJob,
    },
    image::FirmwareImage,
    link::LinkChannel,
    port::{BaudRate, BufferKind, LinkConfig, Port, PortEnumerator, PortInfo},
    protocol::{BootloaderInfo, MAX_TRANSFER_SIZE, Opcode, Status, Timing, region_checksum},
    session::{
        CancelToken, OperationHandle, OperationKind, Request, Session, SessionState,
        SessionStatus,
    },
};
