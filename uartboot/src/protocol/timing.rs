//! Pacing and timeout constants.
//!
//! The device has no flow control and only a small receive buffer. These
//! delays are part of the protocol: the firmware relies on them to finish
//! receiving one frame before the next arrives, and to finish programming a
//! chunk before the next one starts.

use std::time::Duration;

/// Settle time after each short frame (opcode, address, single-frame commands).
pub const FRAME_SETTLE: Duration = Duration::from_millis(100);

/// Settle time after the last ERASE_FLASH frame; erasing is slow on the device.
pub const ERASE_SETTLE: Duration = Duration::from_millis(2000);

/// Gap between the WRITE_FLASH sub-frames of one chunk.
pub const CHUNK_FRAME_GAP: Duration = Duration::from_millis(50);

/// Gap after an acknowledged chunk, covering device-side write latency.
pub const CHUNK_GAP: Duration = Duration::from_millis(100);

/// Read timeout of the drain performed by synchronize.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Wait for the ERASE_FLASH and WRITE_FLASH acknowledgements.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for the READ_FLASH response.
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait for the JUMP_TO_APP acknowledgement.
pub const JUMP_TIMEOUT: Duration = Duration::from_secs(2);

/// Timing applied to one session.
///
/// [`Timing::default`] is the protocol contract. Tests use shorter values
/// against a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// See [`FRAME_SETTLE`].
    pub frame_settle: Duration,
    /// See [`ERASE_SETTLE`].
    pub erase_settle: Duration,
    /// See [`CHUNK_FRAME_GAP`].
    pub chunk_frame_gap: Duration,
    /// See [`CHUNK_GAP`].
    pub chunk_gap: Duration,
    /// See [`DRAIN_TIMEOUT`].
    pub drain_timeout: Duration,
    /// See [`ACK_TIMEOUT`].
    pub ack_timeout: Duration,
    /// See [`READ_TIMEOUT`].
    pub read_timeout: Duration,
    /// See [`JUMP_TIMEOUT`].
    pub jump_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            frame_settle: FRAME_SETTLE,
            erase_settle: ERASE_SETTLE,
            chunk_frame_gap: CHUNK_FRAME_GAP,
            chunk_gap: CHUNK_GAP,
            drain_timeout: DRAIN_TIMEOUT,
            ack_timeout: ACK_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            jump_timeout: JUMP_TIMEOUT,
        }
    }
}

#[cfg(test)]
impl Timing {
    /// No pacing and short timeouts, for the simulated device.
    pub(crate) fn immediate() -> Self {
        let timeout = Duration::from_millis(30);
        Self {
            frame_settle: Duration::ZERO,
            erase_settle: Duration::ZERO,
            chunk_frame_gap: Duration::ZERO,
            chunk_gap: Duration::ZERO,
            drain_timeout: Duration::from_millis(1),
            ack_timeout: timeout,
            read_timeout: timeout,
            jump_timeout: timeout,
        }
    }
}
