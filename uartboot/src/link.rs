//! Link channel: buffer-synchronized blocking I/O over an owned port.
//!
//! Responses carry no length prefix, so a stale byte left over from an
//! earlier exchange shifts every later fixed-size read. Callers must
//! [`synchronize`](LinkChannel::synchronize) before each top-level command.

use {
    crate::{
        error::{Error, Result},
        event::{Event, EventSink},
        port::{BufferKind, Port},
        protocol::{hex_string, timing::DRAIN_TIMEOUT},
    },
    log::{debug, trace, warn},
    std::{
        io::ErrorKind as IoErrorKind,
        thread,
        time::{Duration, Instant},
    },
};

/// Upper bound on drain reads performed by one synchronize.
const MAX_DRAIN_READS: usize = 16;

/// Pause after a zero-length read before asking the port again.
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(1);

/// Owned transport with synchronized, timeout-bounded I/O.
pub struct LinkChannel<P: Port> {
    port: P,
    events: EventSink,
    base_timeout: Duration,
    drain_timeout: Duration,
    open: bool,
}

impl<P: Port> LinkChannel<P> {
    /// Wrap an already opened port.
    pub fn new(port: P) -> Self {
        let base_timeout = port.timeout();
        let open = port.is_open();
        Self {
            port,
            events: EventSink::disconnected(),
            base_timeout,
            drain_timeout: DRAIN_TIMEOUT,
            open,
        }
    }

    /// Route TX/RX notifications into `events`.
    pub fn attach(&mut self, events: EventSink) {
        self.events = events;
    }

    /// Override the drain read timeout used by [`synchronize`](Self::synchronize).
    pub fn set_drain_timeout(&mut self, timeout: Duration) {
        self.drain_timeout = timeout;
    }

    /// Base read timeout from the link configuration.
    pub fn base_timeout(&self) -> Duration {
        self.base_timeout
    }

    /// Get the port name/path.
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Whether the link is usable.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Link(format!("{} is closed", self.port.name())))
        }
    }

    /// Discard pending output, discard unread input, then drain late bytes.
    ///
    /// Returns the number of stray bytes thrown away by the drain. Stray
    /// bytes are reported but never fail the operation.
    pub fn synchronize(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.port.clear_buffers(BufferKind::Output)?;
        self.port.clear_buffers(BufferKind::Input)?;

        let discarded = self.drain()?;
        if discarded > 0 {
            warn!("Discarded {discarded} stray bytes on {}", self.port.name());
            self.events
                .status(format!("Buffer flushed: {discarded} bytes discarded"));
        } else {
            trace!("Link synchronized");
        }
        Ok(discarded)
    }

    fn drain(&mut self) -> Result<usize> {
        self.port.set_timeout(self.drain_timeout)?;

        let mut buf = [0u8; 256];
        let mut discarded = 0;
        let mut result = Ok(());
        for _ in 0..MAX_DRAIN_READS {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    trace!("Drained: {}", hex_string(&buf[..n]));
                    discarded += n;
                },
                Err(e) if is_timeout(e.kind()) => break,
                Err(e) => {
                    result = Err(Error::Link(format!("drain failed: {e}")));
                    break;
                },
            }
        }

        self.port.set_timeout(self.base_timeout)?;
        result.map(|()| discarded)
    }

    /// Write one frame and flush it.
    ///
    /// Emits a TX notification with the exact bytes once they are handed to
    /// the transport.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        trace!("TX {}", hex_string(bytes));

        self.port
            .write_all_bytes(bytes)
            .map_err(|e| Error::Link(format!("write to {} failed: {e}", self.port.name())))?;

        self.events.emit(Event::Tx(bytes.to_vec()));
        Ok(())
    }

    /// Read up to `exact_count` bytes, waiting at most `timeout`.
    ///
    /// Returns whatever arrived; a short read is not an error here. An RX
    /// notification is emitted when at least one byte arrived.
    pub fn read(&mut self, exact_count: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_open()?;

        let deadline = Instant::now() + timeout;
        let mut data = Vec::with_capacity(exact_count);
        let mut buf = vec![0u8; exact_count];
        let mut result = Ok(());

        while data.len() < exact_count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if let Err(e) = self.port.set_timeout(deadline - now) {
                result = Err(e);
                break;
            }

            let wanted = exact_count - data.len();
            match self.port.read(&mut buf[..wanted]) {
                // Some drivers return 0 instead of blocking until the timeout
                Ok(0) => thread::sleep(EMPTY_READ_BACKOFF.min(deadline - now)),
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) if is_timeout(e.kind()) => {},
                Err(e) => {
                    result = Err(Error::Link(format!(
                        "read from {} failed: {e}",
                        self.port.name()
                    )));
                    break;
                },
            }
        }

        self.port.set_timeout(self.base_timeout)?;
        result?;

        if data.is_empty() {
            debug!("No response within {timeout:?}");
        } else {
            trace!("RX {}", hex_string(&data));
            self.events.emit(Event::Rx(data.clone()));
        }
        Ok(data)
    }

    /// Release the transport. Safe to call repeatedly and from failure paths.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.port.close()
    }
}

#[cfg(feature = "native")]
impl LinkChannel<crate::port::NativePort> {
    /// Open the native serial port described by `config`.
    pub fn open(config: &crate::port::LinkConfig) -> Result<Self> {
        let port = crate::port::NativePort::open(config)?;
        Ok(Self::new(port))
    }
}

impl<P: Port> Drop for LinkChannel<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Error closing link: {e}");
        }
    }
}

fn is_timeout(kind: IoErrorKind) -> bool {
    matches!(
        kind,
        IoErrorKind::TimedOut | IoErrorKind::WouldBlock | IoErrorKind::Interrupted
    )
}
