//! Bootloader command codec.
//!
//! ## Wire format
//!
//! Every command starts with a one byte opcode. Integer fields are
//! little-endian `u32`. Most commands are sent as several separate frames,
//! one per field, because the device firmware reads each field with its own
//! blocking receive:
//!
//! ```text
//! GET_INFO      [0x10]                                    -> 90 VV AA AA AA AA
//! ERASE_FLASH   [0x11] [addr:4] [size:4]                  -> 90
//! WRITE_FLASH   [0x12] [addr:4] [size:4] [data:size]      -> 90
//! READ_FLASH    [0x13 addr:4 size:4]   (single frame)     -> 90 DD..(size)
//! GET_CHECKSUM  [0x14] [addr:4] [size:4]                  -> 90 CC CC CC CC
//! JUMP_TO_APP   [0x15]                                    -> 90
//! ```
//!
//! Any status other than `0x90`, or fewer bytes than expected, is a failure.

use {
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian},
    std::fmt,
};

/// Largest READ_FLASH / WRITE_FLASH payload the device accepts.
pub const MAX_TRANSFER_SIZE: u32 = 256;

/// Bootloader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Query version and application address.
    GetInfo = 0x10,
    /// Erase a flash region.
    EraseFlash = 0x11,
    /// Program one chunk.
    WriteFlash = 0x12,
    /// Read back a flash region.
    ReadFlash = 0x13,
    /// Checksum a flash region.
    GetChecksum = 0x14,
    /// Start the application image.
    JumpToApp = 0x15,
}

impl Opcode {
    /// Decode an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::GetInfo),
            0x11 => Some(Self::EraseFlash),
            0x12 => Some(Self::WriteFlash),
            0x13 => Some(Self::ReadFlash),
            0x14 => Some(Self::GetChecksum),
            0x15 => Some(Self::JumpToApp),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetInfo => "GET_INFO",
            Self::EraseFlash => "ERASE_FLASH",
            Self::WriteFlash => "WRITE_FLASH",
            Self::ReadFlash => "READ_FLASH",
            Self::GetChecksum => "GET_CHECKSUM",
            Self::JumpToApp => "JUMP_TO_APP",
        };
        f.write_str(name)
    }
}

/// Response status bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Command accepted.
    Ok = 0x90,
    /// Command failed on the device.
    Error = 0x91,
    /// Opcode not recognised.
    InvalidCmd = 0x92,
}

impl Status {
    /// Decode a status byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x90 => Some(Self::Ok),
            0x91 => Some(Self::Error),
            0x92 => Some(Self::InvalidCmd),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Error => f.write_str("ERROR"),
            Self::InvalidCmd => f.write_str("INVALID_CMD"),
        }
    }
}

/// One command field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<'a> {
    /// Little-endian 32-bit integer.
    U32(u32),
    /// Raw payload bytes.
    Bytes(&'a [u8]),
}

impl Field<'_> {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::U32(value) => {
                let mut raw = [0u8; 4];
                LittleEndian::write_u32(&mut raw, *value);
                buf.extend_from_slice(&raw);
            },
            Self::Bytes(data) => buf.extend_from_slice(data),
        }
    }
}

/// How a command is split into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Opcode and each field are separate writes.
    Split,
    /// Opcode and fields form a single write.
    Single,
}

/// A bootloader command, built per protocol step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    opcode: Opcode,
    fields: Vec<Field<'a>>,
    framing: Framing,
    response_len: usize,
}

impl<'a> Command<'a> {
    /// GET_INFO: status, version byte, 4-byte application address.
    pub fn get_info() -> Self {
        Self {
            opcode: Opcode::GetInfo,
            fields: Vec::new(),
            framing: Framing::Split,
            response_len: 6,
        }
    }

    /// ERASE_FLASH for `[address, address + size)`.
    pub fn erase(address: u32, size: u32) -> Self {
        Self {
            opcode: Opcode::EraseFlash,
            fields: vec![Field::U32(address), Field::U32(size)],
            framing: Framing::Split,
            response_len: 1,
        }
    }

    /// WRITE_FLASH of one chunk at `address`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_chunk(address: u32, data: &'a [u8]) -> Self {
        // Chunks are at most MAX_TRANSFER_SIZE bytes
        Self {
            opcode: Opcode::WriteFlash,
            fields: vec![
                Field::U32(address),
                Field::U32(data.len() as u32),
                Field::Bytes(data),
            ],
            framing: Framing::Split,
            response_len: 1,
        }
    }

    /// READ_FLASH of `size` bytes, sent as one frame.
    pub fn read(address: u32, size: u32) -> Self {
        Self {
            opcode: Opcode::ReadFlash,
            fields: vec![Field::U32(address), Field::U32(size)],
            framing: Framing::Single,
            response_len: 1 + size as usize,
        }
    }

    /// GET_CHECKSUM for `[address, address + size)`.
    pub fn checksum(address: u32, size: u32) -> Self {
        Self {
            opcode: Opcode::GetChecksum,
            fields: vec![Field::U32(address), Field::U32(size)],
            framing: Framing::Split,
            response_len: 5,
        }
    }

    /// JUMP_TO_APP.
    pub fn jump() -> Self {
        Self {
            opcode: Opcode::JumpToApp,
            fields: Vec::new(),
            framing: Framing::Split,
            response_len: 1,
        }
    }

    /// Command opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Command fields, in wire order.
    pub fn fields(&self) -> &[Field<'a>] {
        &self.fields
    }

    /// Frame splitting of this command.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Exact number of response bytes, status included.
    pub fn response_len(&self) -> usize {
        self.response_len
    }

    /// Encode the command into the frames to write, in order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        match self.framing {
            Framing::Split => {
                let mut frames = Vec::with_capacity(1 + self.fields.len());
                frames.push(vec![self.opcode as u8]);
                for field in &self.fields {
                    let mut frame = Vec::new();
                    field.encode_into(&mut frame);
                    frames.push(frame);
                }
                frames
            },
            Framing::Single => {
                let mut frame = vec![self.opcode as u8];
                for field in &self.fields {
                    field.encode_into(&mut frame);
                }
                vec![frame]
            },
        }
    }
}

/// A validated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: Status,
    payload: Vec<u8>,
}

impl Response {
    /// Validate the raw bytes read for `command`.
    ///
    /// Fails with [`Error::Timeout`] when nothing or too little arrived and
    /// with [`Error::Protocol`] when the status byte is not OK or the length
    /// is wrong.
    pub fn decode(command: &Command<'_>, raw: &[u8]) -> Result<Self> {
        let opcode = command.opcode();
        let expected = command.response_len();

        let Some(&first) = raw.first() else {
            return Err(Error::Timeout(format!("{opcode}: no response")));
        };

        if first != Status::Ok as u8 {
            let status = Status::from_byte(first)
                .map_or_else(|| format!("unknown status 0x{first:02X}"), |s| s.to_string());
            return Err(Error::Protocol(format!(
                "{opcode} failed: device returned {status} (response: {})",
                hex_string(raw)
            )));
        }

        if raw.len() < expected {
            return Err(Error::Timeout(format!(
                "{opcode}: expected {expected} bytes, received {} (response: {})",
                raw.len(),
                hex_string(raw)
            )));
        }

        if raw.len() > expected {
            return Err(Error::Protocol(format!(
                "{opcode}: malformed response, expected {expected} bytes, received {}",
                raw.len()
            )));
        }

        Ok(Self {
            status: Status::Ok,
            payload: raw[1..].to_vec(),
        })
    }

    /// Status byte.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Bytes after the status byte.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the response, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Bootloader identity returned by GET_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BootloaderInfo {
    /// Bootloader version byte.
    pub version: u8,
    /// Start address of the application image.
    pub app_address: u32,
}

impl BootloaderInfo {
    /// Parse a GET_INFO response payload.
    pub fn from_response(response: &Response) -> Result<Self> {
        let payload = response.payload();
        if payload.len() != 5 {
            return Err(Error::Protocol(format!(
                "GET_INFO: payload must be 5 bytes, got {}",
                payload.len()
            )));
        }
        Ok(Self {
            version: payload[0],
            app_address: LittleEndian::read_u32(&payload[1..5]),
        })
    }
}

/// Parse a GET_CHECKSUM response payload.
pub fn checksum_from_response(response: &Response) -> Result<u32> {
    let payload = response.payload();
    if payload.len() != 4 {
        return Err(Error::Protocol(format!(
            "GET_CHECKSUM: payload must be 4 bytes, got {}",
            payload.len()
        )));
    }
    Ok(LittleEndian::read_u32(payload))
}

/// Format bytes as space separated upper-case hex, e.g. `DE AD BE EF`.
pub fn hex_string(data: &[u8]) -> String {
    if data.is_empty() {
        return "none".to_string();
    }
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
