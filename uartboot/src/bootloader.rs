//! Paced command/response exchanges with the bootloader.
//!
//! Each method sends one command frame by frame, sleeping the protocol
//! delays between frames, then reads and validates the fixed-size response.
//! Top-level commands synchronize the link first; WRITE_FLASH leaves
//! synchronization to the flash programmer.

use {
    crate::{
        error::Result,
        link::LinkChannel,
        port::Port,
        protocol::{
            BootloaderInfo, Command, Response, Timing, checksum_from_response, hex_string,
        },
    },
    log::{debug, trace},
    std::{thread, time::Duration},
};

/// Borrowed view of a link plus the timing to drive it with.
pub struct Bootloader<'a, P: Port> {
    link: &'a mut LinkChannel<P>,
    timing: &'a Timing,
}

impl<'a, P: Port> Bootloader<'a, P> {
    /// Drive `link` using `timing`.
    pub fn new(link: &'a mut LinkChannel<P>, timing: &'a Timing) -> Self {
        Self { link, timing }
    }

    /// Discard stale bytes before a top-level command.
    pub fn synchronize(&mut self) -> Result<usize> {
        self.link.synchronize()
    }

    /// Write each frame of `command`, sleeping `gap` between frames and
    /// `settle` after the last one.
    fn send(&mut self, command: &Command<'_>, gap: Duration, settle: Duration) -> Result<()> {
        let frames = command.frames();
        trace!("Sending {} as {} frame(s)", command.opcode(), frames.len());

        let last = frames.len().saturating_sub(1);
        for (i, frame) in frames.iter().enumerate() {
            self.link.write(frame)?;
            let pause = if i == last { settle } else { gap };
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }
        Ok(())
    }

    fn transact(
        &mut self,
        command: &Command<'_>,
        gap: Duration,
        settle: Duration,
        timeout: Duration,
    ) -> Result<Response> {
        self.send(command, gap, settle)?;
        let raw = self.link.read(command.response_len(), timeout)?;
        let response = Response::decode(command, &raw)?;
        debug!("{} acknowledged", command.opcode());
        Ok(response)
    }

    /// GET_INFO.
    pub fn get_info(&mut self) -> Result<BootloaderInfo> {
        self.synchronize()?;
        let command = Command::get_info();
        let timeout = self.link.base_timeout();
        let response = self.transact(&command, Duration::ZERO, self.timing.frame_settle, timeout)?;
        BootloaderInfo::from_response(&response)
    }

    /// ERASE_FLASH over `[address, address + size)`.
    pub fn erase(&mut self, address: u32, size: u32) -> Result<()> {
        self.synchronize()?;
        let command = Command::erase(address, size);
        self.transact(
            &command,
            self.timing.frame_settle,
            self.timing.erase_settle,
            self.timing.ack_timeout,
        )?;
        Ok(())
    }

    /// WRITE_FLASH of one chunk. Does not synchronize.
    pub fn write_chunk(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let command = Command::write_chunk(address, data);
        self.transact(
            &command,
            self.timing.chunk_frame_gap,
            Duration::ZERO,
            self.timing.ack_timeout,
        )?;
        Ok(())
    }

    /// READ_FLASH of `size` bytes.
    pub fn read(&mut self, address: u32, size: u32) -> Result<Vec<u8>> {
        self.synchronize()?;
        let command = Command::read(address, size);
        let response = self.transact(
            &command,
            Duration::ZERO,
            self.timing.frame_settle,
            self.timing.read_timeout,
        )?;
        let data = response.into_payload();
        trace!("Read 0x{address:08X}: {}", hex_string(&data));
        Ok(data)
    }

    /// GET_CHECKSUM over `[address, address + size)`.
    pub fn checksum(&mut self, address: u32, size: u32) -> Result<u32> {
        self.synchronize()?;
        let command = Command::checksum(address, size);
        let response = self.transact(
            &command,
            self.timing.frame_settle,
            self.timing.frame_settle,
            self.timing.ack_timeout,
        )?;
        checksum_from_response(&response)
    }

    /// JUMP_TO_APP.
    pub fn jump(&mut self) -> Result<()> {
        self.synchronize()?;
        let command = Command::jump();
        self.transact(
            &command,
            Duration::ZERO,
            self.timing.frame_settle,
            self.timing.jump_timeout,
        )?;
        Ok(())
    }
}
