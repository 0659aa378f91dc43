//! Bootloader protocol: command codec, checksum and pacing.

pub mod checksum;
pub mod command;
pub mod timing;

// Re-export common types
pub use checksum::region_checksum;
pub use command::{
    BootloaderInfo, Command, Field, Framing, MAX_TRANSFER_SIZE, Opcode, Response, Status,
    checksum_from_response, hex_string,
};
pub use timing::Timing;
