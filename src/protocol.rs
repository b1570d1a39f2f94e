use crc16::{State, MODBUS};
use std::fmt;
use thiserror::Error;

pub const DTU_PORT: u16 = 10081;

pub const FRAME_HEADER: &[u8; 2] = b"HM";
pub const FRAME_HEADER_LEN: usize = 10;

//request/response command codes
pub const CMD_APP_INFO_DATA: [u8; 2] = [0xa3, 0x01];
pub const CMD_REAL_DATA_NEW: [u8; 2] = [0xa3, 0x11];

//timezone offset sent with each request (secs)
pub const REQUEST_TIME_OFFSET: u64 = 28800;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("bad frame header: {0:02X?}")]
    BadHeader([u8; 2]),
    #[error("frame length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("crc mismatch: frame 0x{expected:04X}, computed 0x{computed:04X}")]
    Crc { expected: u16, computed: u16 },
    #[error("malformed message body: {0}")]
    Decode(&'static str),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: [u8; 2],
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Frame {{ cmd: {:02X?}, seq: {}, payload: {} bytes }}",
            self.command,
            self.sequence,
            self.payload.len()
        )
    }
}

pub fn checksum(payload: &[u8]) -> u16 {
    State::<MODBUS>::calculate(payload)
}

/// Builds a complete request frame:
/// `HM | cmd(2) | seq(2) | crc16(2) | total length(2) | payload`, all big endian.
pub fn encode_frame(command: [u8; 2], sequence: u16, payload: &[u8]) -> Vec<u8> {
    let total = (FRAME_HEADER_LEN + payload.len()) as u16;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(FRAME_HEADER);
    out.extend_from_slice(&command);
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&checksum(payload).to_be_bytes());
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validates the fixed header and returns the declared total frame length.
pub fn frame_length(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort(header.len()));
    }
    if &header[0..2] != FRAME_HEADER {
        return Err(FrameError::BadHeader([header[0], header[1]]));
    }
    let declared = u16::from_be_bytes([header[8], header[9]]) as usize;
    if declared < FRAME_HEADER_LEN {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: header.len(),
        });
    }
    Ok(declared)
}

pub fn decode_frame(data: &[u8]) -> Result<Frame, FrameError> {
    let declared = frame_length(data)?;
    if declared != data.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }
    let payload = &data[FRAME_HEADER_LEN..];
    let expected = u16::from_be_bytes([data[6], data[7]]);
    let computed = checksum(payload);
    if expected != computed {
        return Err(FrameError::Crc { expected, computed });
    }
    Ok(Frame {
        command: [data[2], data[3]],
        sequence: u16::from_be_bytes([data[4], data[5]]),
        payload: payload.to_vec(),
    })
}

// Message bodies use the protobuf wire encoding. Only the handful of fields the
// exporter consumes are decoded, everything else is skipped.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

impl<'a> FieldValue<'a> {
    /// Signed view of a varint; int32/int64 negatives are sign extended on the wire.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Varint(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64, FrameError> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(FrameError::Decode("truncated varint"))?;
            self.pos += 1;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FrameError::Decode("varint too long"))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(FrameError::Decode("truncated field"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn next_field(&mut self) -> Result<(u32, FieldValue<'a>), FrameError> {
        let key = self.varint()?;
        let number = (key >> 3) as u32;
        let value = match key & 0x07 {
            0 => FieldValue::Varint(self.varint()?),
            1 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.take(8)?);
                FieldValue::Fixed64(u64::from_le_bytes(raw))
            }
            2 => {
                let len = self.varint()? as usize;
                FieldValue::Bytes(self.take(len)?)
            }
            5 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(self.take(4)?);
                FieldValue::Fixed32(u32::from_le_bytes(raw))
            }
            _ => return Err(FrameError::Decode("unsupported wire type")),
        };
        Ok((number, value))
    }
}

impl<'a> Iterator for FieldReader<'a> {
    type Item = Result<(u32, FieldValue<'a>), FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let item = self.next_field();
        if item.is_err() {
            //stop after the first error, the rest of the buffer is garbage
            self.pos = self.buf.len();
        }
        Some(item)
    }
}

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn put_varint_field(out: &mut Vec<u8>, number: u32, value: u64) {
    put_varint(out, (number as u64) << 3);
    put_varint(out, value);
}

pub fn put_bytes_field(out: &mut Vec<u8>, number: u32, value: &[u8]) {
    put_varint(out, ((number as u64) << 3) | 2);
    put_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}
