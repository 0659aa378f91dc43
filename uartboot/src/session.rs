//! Session controller: single-flight operation scheduling over one link.
//!
//! A [`Session`] owns the link. Each accepted [`Request`] runs on its own
//! worker thread so the requester never blocks on serial I/O; everything
//! the operation has to say arrives on the event receiver returned by
//! [`Session::new`], ending with exactly one [`Event::Finished`].
//!
//! Requests are rejected synchronously, before any traffic, when another
//! operation is running ([`Error::Busy`]), when the link is closed, or when
//! the parameters are invalid.

use {
    crate::{
        bootloader::Bootloader,
        error::{Error, ErrorKind, Result},
        event::{Event, EventSink, Failure, Outcome, Report},
        flasher::{FlashOptions, FlashProgrammer, FlashWriteJob, check_image},
        link::LinkChannel,
        port::Port,
        protocol::{MAX_TRANSFER_SIZE, Timing, hex_string},
    },
    log::{debug, error, info},
    std::{
        fmt,
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, Ordering},
            mpsc::{self, Receiver},
        },
        thread::{self, JoinHandle},
    },
};

/// An operation with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Query bootloader version and application address.
    GetInfo,
    /// Erase, then program `image` at `start_address`.
    FlashFirmware {
        /// Raw image bytes.
        image: Vec<u8>,
        /// Target address of the first byte.
        start_address: u32,
        /// Confirm the written region with GET_CHECKSUM.
        verify: bool,
    },
    /// Read `size` bytes at `address` (at most 256).
    ReadFlash {
        /// Start address.
        address: u32,
        /// Bytes to read.
        size: u32,
    },
    /// Erase `size` bytes at `address`.
    EraseFlash {
        /// Start address.
        address: u32,
        /// Bytes to erase.
        size: u32,
    },
    /// Device checksum of `size` bytes at `address`.
    Checksum {
        /// Start address.
        address: u32,
        /// Bytes to include.
        size: u32,
    },
    /// Leave the bootloader and start the application.
    JumpToApplication,
}

impl Request {
    /// Which operation this is.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::GetInfo => OperationKind::GetInfo,
            Self::FlashFirmware { .. } => OperationKind::FlashFirmware,
            Self::ReadFlash { .. } => OperationKind::ReadFlash,
            Self::EraseFlash { .. } => OperationKind::EraseFlash,
            Self::Checksum { .. } => OperationKind::Checksum,
            Self::JumpToApplication => OperationKind::JumpToApplication,
        }
    }

    /// Reject parameters the device cannot act on.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::GetInfo | Self::JumpToApplication => Ok(()),
            Self::FlashFirmware {
                image,
                start_address,
                ..
            } => check_image(image.len(), *start_address),
            Self::ReadFlash { address, size } => {
                if *size == 0 || *size > MAX_TRANSFER_SIZE {
                    return Err(Error::InvalidArgument(format!(
                        "read size must be 1..={MAX_TRANSFER_SIZE} bytes, got {size}"
                    )));
                }
                check_range(*address, *size)
            },
            Self::EraseFlash { address, size } | Self::Checksum { address, size } => {
                if *size == 0 {
                    return Err(Error::InvalidArgument("size must not be zero".into()));
                }
                check_range(*address, *size)
            },
        }
    }
}

fn check_range(address: u32, size: u32) -> Result<()> {
    match address.checked_add(size - 1) {
        Some(_) => Ok(()),
        None => Err(Error::InvalidArgument(format!(
            "{size} bytes at 0x{address:08X} exceed the address space"
        ))),
    }
}

/// Operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum OperationKind {
    /// GET_INFO.
    GetInfo,
    /// Erase and program an image.
    FlashFirmware,
    /// READ_FLASH.
    ReadFlash,
    /// Standalone ERASE_FLASH.
    EraseFlash,
    /// GET_CHECKSUM.
    Checksum,
    /// JUMP_TO_APP.
    JumpToApplication,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetInfo => write!(f, "get-info"),
            Self::FlashFirmware => write!(f, "flash"),
            Self::ReadFlash => write!(f, "read"),
            Self::EraseFlash => write!(f, "erase"),
            Self::Checksum => write!(f, "checksum"),
            Self::JumpToApplication => write!(f, "jump"),
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No operation has run yet.
    #[default]
    Idle,
    /// An operation is in flight.
    Running,
    /// The last operation succeeded.
    Succeeded,
    /// The last operation failed.
    Failed,
}

/// Snapshot of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    /// Lifecycle state.
    pub state: SessionState,
    /// The running operation, or the last one that ran.
    pub operation: Option<OperationKind>,
}

/// Cooperative cancellation flag, checked between flash chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to an accepted operation.
pub struct OperationHandle {
    kind: OperationKind,
    handle: JoinHandle<Outcome>,
}

impl OperationHandle {
    /// The operation this handle tracks.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether the worker has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the operation ends and return its outcome.
    pub fn wait(self) -> Outcome {
        self.handle.join().unwrap_or_else(|_| {
            Outcome::Failed(Failure {
                kind: ErrorKind::Link,
                message: format!("{} worker panicked", self.kind),
            })
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-flight controller owning one link.
pub struct Session<P: Port> {
    link: Arc<Mutex<LinkChannel<P>>>,
    status: Arc<Mutex<SessionStatus>>,
    events: EventSink,
    timing: Arc<Timing>,
    cancel: CancelToken,
}

impl<P: Port + 'static> Session<P> {
    /// Take ownership of `link` and return the session with its event
    /// receiver.
    pub fn new(mut link: LinkChannel<P>) -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let events = EventSink::new(tx);
        let timing = Timing::default();

        link.attach(events.clone());
        link.set_drain_timeout(timing.drain_timeout);

        let session = Self {
            link: Arc::new(Mutex::new(link)),
            status: Arc::new(Mutex::new(SessionStatus::default())),
            events,
            timing: Arc::new(timing),
            cancel: CancelToken::new(),
        };
        (session, rx)
    }

    /// Replace the protocol timing.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        lock(&self.link).set_drain_timeout(timing.drain_timeout);
        self.timing = Arc::new(timing);
        self
    }

    /// Current state and operation.
    pub fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    /// Whether an operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.status().state == SessionState::Running
    }

    /// Ask the running operation to stop at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token shared with every operation of this session.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Start `request` on a worker thread.
    pub fn submit(&self, request: Request) -> Result<OperationHandle> {
        request.validate()?;
        let kind = request.kind();

        let previous = {
            let mut status = lock(&self.status);
            if status.state == SessionState::Running {
                debug!("Rejecting {kind}: {:?} in flight", status.operation);
                return Err(Error::Busy);
            }
            // Not running, so no worker holds the link
            let link = lock(&self.link);
            if !link.is_open() {
                return Err(Error::Link(format!("{} is closed", link.name())));
            }
            let previous = *status;
            *status = SessionStatus {
                state: SessionState::Running,
                operation: Some(kind),
            };
            previous
        };
        self.cancel.reset();
        info!("Starting {kind}");

        let worker = Worker {
            link: Arc::clone(&self.link),
            status: Arc::clone(&self.status),
            events: self.events.clone(),
            timing: Arc::clone(&self.timing),
            cancel: self.cancel.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("uartboot-{kind}"))
            .spawn(move || worker.run(request));

        match spawned {
            Ok(handle) => Ok(OperationHandle { kind, handle }),
            Err(e) => {
                *lock(&self.status) = previous;
                Err(Error::Io(e))
            },
        }
    }

    /// Submit [`Request::GetInfo`].
    pub fn get_info(&self) -> Result<OperationHandle> {
        self.submit(Request::GetInfo)
    }

    /// Submit [`Request::FlashFirmware`].
    pub fn flash_firmware(
        &self,
        image: Vec<u8>,
        start_address: u32,
        options: FlashOptions,
    ) -> Result<OperationHandle> {
        self.submit(Request::FlashFirmware {
            image,
            start_address,
            verify: options.verify,
        })
    }

    /// Submit [`Request::ReadFlash`].
    pub fn read_flash(&self, address: u32, size: u32) -> Result<OperationHandle> {
        self.submit(Request::ReadFlash { address, size })
    }

    /// Submit [`Request::EraseFlash`].
    pub fn erase_flash(&self, address: u32, size: u32) -> Result<OperationHandle> {
        self.submit(Request::EraseFlash { address, size })
    }

    /// Submit [`Request::Checksum`].
    pub fn checksum(&self, address: u32, size: u32) -> Result<OperationHandle> {
        self.submit(Request::Checksum { address, size })
    }

    /// Submit [`Request::JumpToApplication`].
    pub fn jump_to_application(&self) -> Result<OperationHandle> {
        self.submit(Request::JumpToApplication)
    }

    /// Close the link. Refused while an operation is in flight.
    pub fn close(&self) -> Result<()> {
        let status = lock(&self.status);
        if status.state == SessionState::Running {
            return Err(Error::Busy);
        }
        lock(&self.link).close()
    }
}

/// State moved onto the worker thread.
struct Worker<P: Port> {
    link: Arc<Mutex<LinkChannel<P>>>,
    status: Arc<Mutex<SessionStatus>>,
    events: EventSink,
    timing: Arc<Timing>,
    cancel: CancelToken,
}

impl<P: Port> Worker<P> {
    fn run(self, request: Request) -> Outcome {
        let kind = request.kind();
        let result = {
            let mut link = lock(&self.link);
            self.execute(&mut link, request)
        };

        let outcome = match result {
            Ok(report) => {
                info!("{kind} succeeded");
                Outcome::Succeeded(report)
            },
            Err(e) => {
                error!("{kind} failed: {e}");
                self.events.status(format!("Error: {e}"));
                Outcome::Failed(Failure::from(&e))
            },
        };

        // Finished is sent under the guard: nobody sees the session idle first
        let mut status = lock(&self.status);
        status.state = if outcome.is_success() {
            SessionState::Succeeded
        } else {
            SessionState::Failed
        };
        self.events.emit(Event::Finished(outcome.clone()));
        drop(status);
        outcome
    }

    fn execute(&self, link: &mut LinkChannel<P>, request: Request) -> Result<Report> {
        let events = &self.events;
        match request {
            Request::GetInfo => {
                events.status("Requesting bootloader info...");
                let info = Bootloader::new(link, &self.timing).get_info()?;
                events.status(format!("Bootloader version: {}", info.version));
                events.status(format!("Application address: 0x{:08X}", info.app_address));
                Ok(Report::Info(info))
            },
            Request::FlashFirmware {
                image,
                start_address,
                verify,
            } => {
                let mut job = FlashWriteJob::new(image, start_address)?;
                events.status(format!(
                    "Flashing {} bytes to 0x{start_address:08X}",
                    job.len()
                ));
                let summary = FlashProgrammer::new(link, &self.timing, events, &self.cancel)
                    .run(&mut job, FlashOptions { verify })?;
                events.status(format!(
                    "Flash complete: {} bytes in {} chunks",
                    summary.bytes, summary.chunks
                ));
                Ok(Report::Flashed(summary))
            },
            Request::ReadFlash { address, size } => {
                events.status(format!("Reading {size} bytes at 0x{address:08X}..."));
                let data = Bootloader::new(link, &self.timing).read(address, size)?;
                events.status(format!("Flash read (0x{address:08X}): {}", hex_string(&data)));
                Ok(Report::Read { address, data })
            },
            Request::EraseFlash { address, size } => {
                events.status(format!("Erasing {size} bytes at 0x{address:08X}..."));
                Bootloader::new(link, &self.timing).erase(address, size)?;
                events.status("Erase complete");
                Ok(Report::Erased { address, size })
            },
            Request::Checksum { address, size } => {
                let value = Bootloader::new(link, &self.timing).checksum(address, size)?;
                events.status(format!(
                    "Checksum (0x{address:08X}, {size} bytes): 0x{value:08X}"
                ));
                Ok(Report::Checksum {
                    address,
                    size,
                    value,
                })
            },
            Request::JumpToApplication => {
                events.status("Jumping to application...");
                Bootloader::new(link, &self.timing).jump()?;
                events.status("Application started");
                Ok(Report::Jumped)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        port::sim::SimDevice,
        protocol::{BootloaderInfo, Opcode},
    };
    use std::time::Duration;

    fn session(device: &SimDevice) -> (Session<SimDevice>, Receiver<Event>) {
        session_with(device, Timing::immediate())
    }

    fn session_with(device: &SimDevice, timing: Timing) -> (Session<SimDevice>, Receiver<Event>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (session, rx) = Session::new(LinkChannel::new(device.clone()));
        (session.with_timing(timing), rx)
    }

    /// Collect events up to and including the terminal one.
    fn drain(rx: &Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = matches!(event, Event::Finished(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn statuses(events: &[Event]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Status(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    fn finished(events: &[Event]) -> Vec<&Outcome> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Finished(outcome) => Some(outcome),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_get_info_reports_version_and_address() {
        let device = SimDevice::new();
        device.respond_to(Opcode::GetInfo, &[0x90, 0x02, 0x00, 0x80, 0x00, 0x08]);
        let (session, rx) = session(&device);

        let outcome = session.get_info().unwrap().wait();
        let events = drain(&rx);

        let info = BootloaderInfo {
            version: 2,
            app_address: 0x0800_8000,
        };
        assert_eq!(outcome, Outcome::Succeeded(Report::Info(info)));
        let lines = statuses(&events);
        assert!(lines.contains(&"Bootloader version: 2"));
        assert!(lines.contains(&"Application address: 0x08008000"));
        assert!(events.contains(&Event::Tx(vec![0x10])));
        assert!(events.contains(&Event::Rx(vec![0x90, 0x02, 0x00, 0x80, 0x00, 0x08])));
        assert_eq!(session.status().state, SessionState::Succeeded);
    }

    #[test]
    fn test_read_flash_reports_hex() {
        let device = SimDevice::new();
        device.respond_to(Opcode::ReadFlash, &[0x90, 0xDE, 0xAD, 0xBE, 0xEF]);
        let (session, rx) = session(&device);

        let outcome = session.read_flash(0x0800_8000, 4).unwrap().wait();
        let events = drain(&rx);

        assert_eq!(
            outcome.report(),
            Some(&Report::Read {
                address: 0x0800_8000,
                data: vec![0xDE, 0xAD, 0xBE, 0xEF],
            })
        );
        assert!(statuses(&events).contains(&"Flash read (0x08008000): DE AD BE EF"));
    }

    #[test]
    fn test_flash_firmware_end_to_end() {
        let device = SimDevice::new();
        let image: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let (session, rx) = session(&device);

        let outcome = session
            .flash_firmware(image.clone(), 0x0800_8000, FlashOptions { verify: true })
            .unwrap()
            .wait();
        let events = drain(&rx);

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(device.flash(0x0800_8000, 300), image);
        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                Event::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![33, 66, 100]);
        assert_eq!(finished(&events).len(), 1);
    }

    #[test]
    fn test_erase_failure_leaves_link_open() {
        let device = SimDevice::new();
        device.respond_to(Opcode::EraseFlash, &[0x91]);
        let (session, rx) = session(&device);

        let outcome = session.erase_flash(0x0800_8000, 0x1000).unwrap().wait();
        let events = drain(&rx);

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Protocol);
        assert_eq!(finished(&events).len(), 1);
        assert_eq!(session.status().state, SessionState::Failed);

        // A fresh operation can run on the same link
        let retry = session.jump_to_application().unwrap().wait();
        assert!(retry.is_success());
        assert_eq!(session.status().state, SessionState::Succeeded);
    }

    #[test]
    fn test_busy_rejection() {
        let device = SimDevice::new();
        // GET_INFO waits for the link base timeout
        device.clone().set_timeout(Duration::from_millis(500)).unwrap();
        device.hold_responses(true);
        let (session, rx) = session(&device);

        let running = session.get_info().unwrap();
        assert!(session.is_busy());
        assert!(matches!(session.jump_to_application(), Err(Error::Busy)));
        assert!(matches!(session.close(), Err(Error::Busy)));
        assert_eq!(
            session.status(),
            SessionStatus {
                state: SessionState::Running,
                operation: Some(OperationKind::GetInfo),
            }
        );

        // The held request times out on its own
        let outcome = running.wait();
        assert_eq!(outcome.failure().unwrap().kind, ErrorKind::Timeout);
        let events = drain(&rx);
        assert_eq!(finished(&events).len(), 1);
        // The rejected jump never reached the wire
        assert!(!events.contains(&Event::Tx(vec![0x15])));
    }

    #[test]
    fn test_closed_link_rejected() {
        let device = SimDevice::new();
        let (session, _rx) = session(&device);

        session.close().unwrap();
        let err = session.get_info().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Link);
        assert_eq!(session.status().state, SessionState::Idle);
        assert!(device.written().is_empty());
    }

    #[test]
    fn test_invalid_requests_rejected_synchronously() {
        let device = SimDevice::new();
        let (session, _rx) = session(&device);

        let cases = [
            Request::FlashFirmware {
                image: Vec::new(),
                start_address: 0x0800_8000,
                verify: false,
            },
            Request::ReadFlash {
                address: 0x0800_8000,
                size: 0,
            },
            Request::ReadFlash {
                address: 0x0800_8000,
                size: 257,
            },
            Request::EraseFlash {
                address: 0x0800_8000,
                size: 0,
            },
            Request::Checksum {
                address: u32::MAX,
                size: 2,
            },
        ];
        for request in cases {
            let err = session.submit(request.clone()).err().unwrap();
            assert!(matches!(err, Error::InvalidArgument(_)), "{request:?}");
        }
        assert_eq!(session.status().state, SessionState::Idle);
        assert!(device.ops().is_empty());
    }

    #[test]
    fn test_cancelled_flash_fails() {
        let device = SimDevice::new();
        device.hold_responses(true);
        let timing = Timing {
            ack_timeout: Duration::from_secs(5),
            ..Timing::immediate()
        };
        let (session, rx) = session_with(&device, timing);

        let handle = session
            .flash_firmware(vec![0xAB; 1024], 0x0800_8000, FlashOptions::default())
            .unwrap();
        // The erase ack is held, so the cancel lands before chunk 0
        session.cancel();
        device.hold_responses(false);
        let outcome = handle.wait();
        let events = drain(&rx);

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert_eq!(device.writes_seen(), 0);
        assert_eq!(finished(&events).len(), 1);
        assert_eq!(session.status().state, SessionState::Failed);
    }

    #[test]
    fn test_finished_sent_before_session_goes_idle() {
        let device = SimDevice::new();
        device.respond_to(Opcode::GetInfo, &[0x90, 0x02, 0x00, 0x80, 0x00, 0x08]);
        let (session, rx) = session(&device);

        let handle = session.get_info().unwrap();
        while session.is_busy() {
            std::thread::yield_now();
        }
        // Already queued: no waiting on the receiver
        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(finished(&events).len(), 1);
        assert!(handle.wait().is_success());
    }

    #[test]
    fn test_checksum_report() {
        let device = SimDevice::new();
        device.write_flash(0x0800_8000, &[0x01, 0x02]);
        let (session, _rx) = session(&device);

        let outcome = session.checksum(0x0800_8000, 2).unwrap().wait();
        assert_eq!(
            outcome.report(),
            Some(&Report::Checksum {
                address: 0x0800_8000,
                size: 2,
                value: 0,
            })
        );
    }
}
