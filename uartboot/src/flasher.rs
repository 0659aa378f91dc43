//! Chunked firmware programming.
//!
//! A flash write erases the target region once, then sends the image as
//! consecutive [`CHUNK_SIZE`] byte WRITE_FLASH commands. Every
//! [`SYNC_INTERVAL`]th chunk is preceded by a link synchronize. The first
//! failed chunk aborts the run; chunks are never retried.

use {
    crate::{
        bootloader::Bootloader,
        error::{Error, Result},
        event::EventSink,
        link::LinkChannel,
        port::Port,
        protocol::{Timing, region_checksum},
        session::CancelToken,
    },
    log::{debug, info, warn},
    std::thread,
};

/// Payload bytes per WRITE_FLASH command.
pub const CHUNK_SIZE: usize = 128;

/// Synchronize the link before chunk `i` when `i % SYNC_INTERVAL == 0`.
pub const SYNC_INTERVAL: usize = 5;

/// Emit a status line for chunk `i` when `i % STATUS_INTERVAL == 0`.
pub const STATUS_INTERVAL: usize = 10;

/// One slice of the image and where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// 0-based chunk index.
    pub index: usize,
    /// Flash address of the first byte.
    pub address: u32,
    /// Payload, at most [`CHUNK_SIZE`] bytes.
    pub data: &'a [u8],
}

/// An image split into chunks, plus how far programming got.
#[derive(Debug, Clone)]
pub struct FlashWriteJob {
    image: Vec<u8>,
    start_address: u32,
    chunk_size: usize,
    current_chunk: usize,
}

impl FlashWriteJob {
    /// Build a job writing `image` at `start_address`.
    ///
    /// Rejects an empty image and images that would run past the end of
    /// the 32-bit address space.
    pub fn new(image: Vec<u8>, start_address: u32) -> Result<Self> {
        check_image(image.len(), start_address)?;
        Ok(Self {
            image,
            start_address,
            chunk_size: CHUNK_SIZE,
            current_chunk: 0,
        })
    }

    /// Image bytes.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.image.len()
    }

    /// Always false; empty images are rejected by [`new`](Self::new).
    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Target address of the first byte.
    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    /// Number of chunks, `ceil(len / CHUNK_SIZE)`.
    pub fn chunk_count(&self) -> usize {
        self.image.len().div_ceil(self.chunk_size)
    }

    /// Index of the next chunk to send.
    pub fn current_chunk(&self) -> usize {
        self.current_chunk
    }

    /// Flash address of chunk `index`.
    pub fn write_address(&self, index: usize) -> u32 {
        // Bounded by the check in `new`
        self.start_address + (index * self.chunk_size) as u32
    }

    /// Chunk `index`, if it exists.
    pub fn chunk(&self, index: usize) -> Option<Chunk<'_>> {
        let start = index.checked_mul(self.chunk_size)?;
        if start >= self.image.len() {
            return None;
        }
        let end = (start + self.chunk_size).min(self.image.len());
        Some(Chunk {
            index,
            address: self.write_address(index),
            data: &self.image[start..end],
        })
    }

    /// All chunks in order.
    pub fn chunks(&self) -> impl Iterator<Item = Chunk<'_>> {
        (0..self.chunk_count()).filter_map(|i| self.chunk(i))
    }

    /// Percentage reported once chunk `index` is acknowledged.
    pub fn progress_after(&self, index: usize) -> u8 {
        ((index + 1) * 100 / self.chunk_count()).min(100) as u8
    }

    /// Mark the current chunk as acknowledged.
    pub fn advance(&mut self) {
        if self.current_chunk < self.chunk_count() {
            self.current_chunk += 1;
        }
    }

    /// Whether every chunk has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.current_chunk >= self.chunk_count()
    }
}

/// Check that an image of `len` bytes can be written at `start_address`.
pub(crate) fn check_image(len: usize, start_address: u32) -> Result<()> {
    if len == 0 {
        return Err(Error::InvalidArgument("no firmware data".into()));
    }
    let len = u32::try_from(len)
        .map_err(|_| Error::InvalidArgument(format!("firmware too large: {len} bytes")))?;
    if start_address.checked_add(len - 1).is_none() {
        return Err(Error::InvalidArgument(format!(
            "{len} bytes at 0x{start_address:08X} exceed the address space"
        )));
    }
    Ok(())
}

/// Where a flash write is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Nothing started.
    Idle,
    /// ERASE_FLASH sent, waiting for the ack.
    Erasing,
    /// Writing the chunk with this index.
    Writing(usize),
    /// Comparing the device checksum with the image.
    Verifying,
    /// Every chunk acknowledged.
    Completed,
    /// Stopped at the first failure.
    Failed,
}

/// Flash write options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashOptions {
    /// Compare a GET_CHECKSUM of the written region with the image.
    pub verify: bool,
}

/// Result of a successful flash write.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FlashSummary {
    /// Address of the first byte written.
    pub start_address: u32,
    /// Bytes written.
    pub bytes: usize,
    /// WRITE_FLASH commands sent.
    pub chunks: usize,
    /// Checksum confirmed by the device when verification ran.
    pub checksum: Option<u32>,
}

/// Drives a [`FlashWriteJob`] over a link.
pub struct FlashProgrammer<'a, P: Port> {
    bootloader: Bootloader<'a, P>,
    timing: &'a Timing,
    events: &'a EventSink,
    cancel: &'a CancelToken,
    state: FlashState,
}

impl<'a, P: Port> FlashProgrammer<'a, P> {
    /// Create a programmer for one run.
    pub fn new(
        link: &'a mut LinkChannel<P>,
        timing: &'a Timing,
        events: &'a EventSink,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            bootloader: Bootloader::new(link, timing),
            timing,
            events,
            cancel,
            state: FlashState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Erase, write every remaining chunk, then optionally verify.
    pub fn run(&mut self, job: &mut FlashWriteJob, options: FlashOptions) -> Result<FlashSummary> {
        let result = self.execute(job, options);
        if let Err(e) = &result {
            warn!("Flash write stopped at chunk {}: {e}", job.current_chunk());
            self.state = FlashState::Failed;
        }
        result
    }

    fn execute(&mut self, job: &mut FlashWriteJob, options: FlashOptions) -> Result<FlashSummary> {
        let start = job.start_address();
        let len = job.len() as u32;
        let count = job.chunk_count();

        self.state = FlashState::Erasing;
        self.events
            .status(format!("Erasing {len} bytes at 0x{start:08X}..."));
        // Exactly the image range: a trailing partial sector is not rounded up
        self.bootloader.erase(start, len)?;
        self.events.status("Erase complete");

        info!("Writing {len} bytes in {count} chunks at 0x{start:08X}");
        while !job.is_complete() {
            let index = job.current_chunk();
            self.state = FlashState::Writing(index);

            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled(format!(
                    "flash write cancelled after {index} of {count} chunks"
                )));
            }
            if index % SYNC_INTERVAL == 0 {
                self.bootloader.synchronize()?;
            }

            let Some(chunk) = job.chunk(index) else {
                break;
            };
            let line = format!(
                "Chunk {}/{count}: addr=0x{:08X}, size={}",
                index + 1,
                chunk.address,
                chunk.data.len()
            );
            debug!("{line}");
            self.bootloader
                .write_chunk(chunk.address, chunk.data)
                .map_err(|e| at_chunk(e, &chunk, count))?;

            job.advance();
            self.events.progress(job.progress_after(index));
            if index % STATUS_INTERVAL == 0 {
                self.events.status(line);
            }

            if !self.timing.chunk_gap.is_zero() {
                thread::sleep(self.timing.chunk_gap);
            }
        }

        let checksum = if options.verify {
            self.state = FlashState::Verifying;
            self.events.status("Verifying...");
            Some(self.verify(job)?)
        } else {
            None
        };

        self.state = FlashState::Completed;
        Ok(FlashSummary {
            start_address: start,
            bytes: job.len(),
            chunks: count,
            checksum,
        })
    }

    fn verify(&mut self, job: &FlashWriteJob) -> Result<u32> {
        let expected = region_checksum(job.image());
        let actual = self
            .bootloader
            .checksum(job.start_address(), job.len() as u32)?;
        if actual != expected {
            return Err(Error::Protocol(format!(
                "verification failed: image checksum 0x{expected:08X}, device reported 0x{actual:08X}"
            )));
        }
        debug!("Checksum 0x{actual:08X} verified");
        Ok(actual)
    }
}

fn at_chunk(err: Error, chunk: &Chunk<'_>, count: usize) -> Error {
    let place = format!("chunk {}/{count} at 0x{:08X}", chunk.index + 1, chunk.address);
    match err {
        Error::Protocol(msg) => Error::Protocol(format!("{place}: {msg}")),
        Error::Timeout(msg) => Error::Timeout(format!("{place}: {msg}")),
        other => other,
    }
}
