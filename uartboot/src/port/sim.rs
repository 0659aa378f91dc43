//! Simulated bootloader device for tests.
//!
//! Parses host frames the way the device firmware does (opcode first, then
//! each field as it arrives), keeps a flash image, and answers with the
//! same status bytes. Faults can be injected per opcode or per chunk. Every
//! port call is recorded so tests can check frame ordering and
//! synchronization.

use {
    crate::{
        error::{Error, Result},
        port::{BufferKind, Port},
        protocol::{MAX_TRANSFER_SIZE, Opcode, Status, region_checksum},
    },
    byteorder::{ByteOrder, LittleEndian},
    std::{
        collections::{HashMap, VecDeque},
        io::{self, Read, Write},
        sync::{Arc, Mutex, PoisonError},
        thread,
        time::Duration,
    },
};

/// Start of the simulated flash.
pub(crate) const FLASH_BASE: u32 = 0x0800_0000;

/// Size of the simulated flash (512 KiB).
pub(crate) const FLASH_SIZE: usize = 0x8_0000;

/// One recorded port call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PortOp {
    Clear(BufferKind),
    Write(Vec<u8>),
    Close,
}

struct SimState {
    open: bool,
    timeout: Duration,
    rx: VecDeque<u8>,
    pending: Vec<u8>,
    after_clear: Option<Vec<u8>>,
    hold: bool,
    ops: Vec<PortOp>,
    flash: Vec<u8>,
    version: u8,
    app_address: u32,
    canned: HashMap<Opcode, VecDeque<Vec<u8>>>,
    fail_write_at: Option<usize>,
    silent_write_at: Option<usize>,
    echo_after_write: Option<(usize, Vec<u8>)>,
    writes_seen: usize,
    zero_on_empty: bool,
    reads: usize,
}

/// Cloneable handle to one simulated device.
#[derive(Clone)]
pub(crate) struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                open: true,
                timeout: Duration::from_millis(20),
                rx: VecDeque::new(),
                pending: Vec::new(),
                after_clear: None,
                hold: false,
                ops: Vec::new(),
                flash: vec![0x00; FLASH_SIZE],
                version: 1,
                app_address: 0x0800_8000,
                canned: HashMap::new(),
                fail_write_at: None,
                silent_write_at: None,
                echo_after_write: None,
                writes_seen: 0,
                zero_on_empty: false,
                reads: 0,
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer the next `opcode` command with `bytes` instead of emulating it.
    pub(crate) fn respond_to(&self, opcode: Opcode, bytes: &[u8]) {
        self.state()
            .canned
            .entry(opcode)
            .or_default()
            .push_back(bytes.to_vec());
    }

    /// Reply ERROR to the WRITE_FLASH with this 0-based index.
    pub(crate) fn fail_write_at(&self, index: usize) {
        self.state().fail_write_at = Some(index);
    }

    /// Never reply to the WRITE_FLASH with this 0-based index.
    pub(crate) fn silence_write_at(&self, index: usize) {
        self.state().silent_write_at = Some(index);
    }

    /// Send `bytes` right after the ack of the WRITE_FLASH with this 0-based index.
    pub(crate) fn echo_after_write(&self, index: usize, bytes: &[u8]) {
        self.state().echo_after_write = Some((index, bytes.to_vec()));
    }

    /// Return `Ok(0)` at once instead of timing out when nothing is queued.
    pub(crate) fn return_zero_on_empty(&self, zero: bool) {
        self.state().zero_on_empty = zero;
    }

    /// Number of `read` calls made on the port.
    pub(crate) fn reads(&self) -> usize {
        self.state().reads
    }

    /// Queue bytes as if they were already received by the host.
    pub(crate) fn push_stray(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes);
    }

    /// Bytes that arrive right after the next input-buffer discard.
    pub(crate) fn inject_after_clear(&self, bytes: &[u8]) {
        self.state().after_clear = Some(bytes.to_vec());
    }

    /// While held, responses are produced but not delivered.
    pub(crate) fn hold_responses(&self, hold: bool) {
        self.state().hold = hold;
    }

    pub(crate) fn set_info(&self, version: u8, app_address: u32) {
        let mut state = self.state();
        state.version = version;
        state.app_address = app_address;
    }

    pub(crate) fn ops(&self) -> Vec<PortOp> {
        self.state().ops.clone()
    }

    /// Every frame written, in order.
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                PortOp::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of WRITE_FLASH commands the device received.
    pub(crate) fn writes_seen(&self) -> usize {
        self.state().writes_seen
    }

    pub(crate) fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        let offset = (address - FLASH_BASE) as usize;
        self.state().flash[offset..offset + len].to_vec()
    }

    pub(crate) fn write_flash(&self, address: u32, data: &[u8]) {
        let offset = (address - FLASH_BASE) as usize;
        self.state().flash[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl SimState {
    fn region(&self, address: u32, size: u32) -> Option<std::ops::Range<usize>> {
        let start = address.checked_sub(FLASH_BASE)? as usize;
        let end = start.checked_add(size as usize)?;
        (end <= self.flash.len()).then_some(start..end)
    }

    fn process(&mut self) {
        while let Some(&first) = self.pending.first() {
            let needed = match Opcode::from_byte(first) {
                Some(Opcode::GetInfo | Opcode::JumpToApp) | None => 1,
                Some(Opcode::EraseFlash | Opcode::ReadFlash | Opcode::GetChecksum) => 9,
                Some(Opcode::WriteFlash) => {
                    if self.pending.len() < 9 {
                        break;
                    }
                    let size = LittleEndian::read_u32(&self.pending[5..9]);
                    9 + size.min(MAX_TRANSFER_SIZE) as usize
                },
            };
            if self.pending.len() < needed {
                break;
            }
            let frame: Vec<u8> = self.pending.drain(..needed).collect();
            let response = self.execute(&frame);
            self.rx.extend(response);
        }
    }

    fn execute(&mut self, frame: &[u8]) -> Vec<u8> {
        let ok = Status::Ok as u8;
        let error = vec![Status::Error as u8];

        let Some(opcode) = Opcode::from_byte(frame[0]) else {
            return vec![Status::InvalidCmd as u8];
        };

        let write_index = (opcode == Opcode::WriteFlash).then(|| {
            self.writes_seen += 1;
            self.writes_seen - 1
        });

        if let Some(canned) = self.canned.get_mut(&opcode).and_then(VecDeque::pop_front) {
            return canned;
        }

        let address = frame.get(1..5).map_or(0, LittleEndian::read_u32);
        let size = frame.get(5..9).map_or(0, LittleEndian::read_u32);

        match opcode {
            Opcode::GetInfo => {
                let mut response = vec![ok, self.version, 0, 0, 0, 0];
                LittleEndian::write_u32(&mut response[2..6], self.app_address);
                response
            },
            Opcode::EraseFlash => match self.region(address, size) {
                Some(range) => {
                    self.flash[range].fill(0xFF);
                    vec![ok]
                },
                None => error,
            },
            Opcode::WriteFlash => {
                if write_index == self.fail_write_at {
                    return error;
                }
                if write_index == self.silent_write_at {
                    return Vec::new();
                }
                match self.region(address, size) {
                    Some(range) if size <= MAX_TRANSFER_SIZE => {
                        self.flash[range].copy_from_slice(&frame[9..]);
                        let mut response = vec![ok];
                        if let Some((_, echo)) = self
                            .echo_after_write
                            .as_ref()
                            .filter(|(index, _)| write_index == Some(*index))
                        {
                            response.extend_from_slice(echo);
                        }
                        response
                    },
                    _ => error,
                }
            },
            Opcode::ReadFlash => match self.region(address, size) {
                Some(range) if size <= MAX_TRANSFER_SIZE => {
                    let mut response = vec![ok];
                    response.extend_from_slice(&self.flash[range]);
                    response
                },
                _ => error,
            },
            Opcode::GetChecksum => match self.region(address, size) {
                Some(range) if size > 0 => {
                    let mut response = vec![ok, 0, 0, 0, 0];
                    LittleEndian::write_u32(&mut response[1..5], region_checksum(&self.flash[range]));
                    response
                },
                _ => error,
            },
            Opcode::JumpToApp => vec![ok],
        }
    }
}

impl Port for SimDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.state().timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.state().timeout
    }

    fn clear_buffers(&mut self, which: BufferKind) -> Result<()> {
        let mut state = self.state();
        if !state.open {
            return Err(Error::Link("sim closed".into()));
        }
        state.ops.push(PortOp::Clear(which));
        if matches!(which, BufferKind::Input | BufferKind::All) {
            state.rx.clear();
            if let Some(late) = state.after_clear.take() {
                state.rx.extend(late);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.open {
            state.open = false;
            state.ops.push(PortOp::Close);
        }
        Ok(())
    }
}

impl Read for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let wait = {
            let mut state = self.state();
            if !state.open {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "sim closed"));
            }
            state.reads += 1;
            if !state.hold && !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.zero_on_empty {
                return Ok(0);
            }
            state.timeout.min(Duration::from_millis(1))
        };
        thread::sleep(wait);
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for SimDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "sim closed"));
        }
        state.ops.push(PortOp::Write(buf.to_vec()));
        state.pending.extend_from_slice(buf);
        state.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
