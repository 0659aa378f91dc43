//! Flash region checksum as computed by the bootloader for GET_CHECKSUM.
//!
//! For every byte: `sum ^= byte; sum = sum.rotate_left(1)`, starting from 0.

/// Compute the bootloader checksum of `data`.
pub fn region_checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |sum, &byte| {
        (sum ^ u32::from(byte)).rotate_left(1)
    })
}
