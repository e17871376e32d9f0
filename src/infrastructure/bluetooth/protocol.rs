//! Motor Controller Wire Protocol
//!
//! This module contains the framing used on the command and telemetry
//! characteristics: encoding a command, validating a response frame, and
//! reassembling frames that arrive split across notifications.
//!
//! # Frame Structure
//!
//! ```text
//! [0]         : 0x02 start marker (short frame)
//! [1]         : N, payload length (0-255)
//! [2..2+N]    : payload (command id + args, or command echo + record)
//! [2+N..4+N]  : CRC16 of payload, big-endian
//! [4+N]       : 0x03 end marker
//! ```

use tracing::{trace, warn};

pub const START_BYTE: u8 = 0x02;
pub const END_BYTE: u8 = 0x03;

/// Start marker, length, two CRC bytes and end marker.
pub const FRAME_OVERHEAD: usize = 5;

/// Largest payload a single-byte length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

const CRC16_POLY: u16 = 0x1021;

/// Remainder of every possible leading byte against a zero register.
static CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC16-CCITT (poly 0x1021, zero init, MSB first).
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &b| {
        let index = ((crc >> 8) ^ b as u16) as usize;
        CRC16_TABLE[index] ^ (crc << 8)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame does not start with 0x02 (got {0:#04X})")]
    InvalidStartByte(u8),

    #[error("invalid frame length (declared {declared:?}, frame {actual} bytes)")]
    InvalidLength {
        declared: Option<usize>,
        actual: usize,
    },

    #[error("CRC mismatch (expected {expected:#06X}, received {received:#06X})")]
    InvalidCrc { expected: u16, received: u16 },

    #[error("payload too large ({size} bytes, max 255)")]
    PayloadTooLarge { size: usize },
}

/// An encoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The framed payload (command id first).
    pub fn payload(&self) -> &[u8] {
        &self.0[2..self.0.len() - 3]
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Frame a command: the payload on the wire is `command_id` followed by
/// `args`.
pub fn encode(command_id: u8, args: &[u8]) -> Result<Frame, FrameError> {
    let len = args.len() + 1;
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge { size: len });
    }

    let mut bytes = Vec::with_capacity(len + FRAME_OVERHEAD);
    bytes.push(START_BYTE);
    bytes.push(len as u8);
    bytes.push(command_id);
    bytes.extend_from_slice(args);
    let crc = crc16(&bytes[2..]);
    bytes.extend_from_slice(&crc.to_be_bytes());
    bytes.push(END_BYTE);
    Ok(Frame(bytes))
}

/// Validate a complete frame and return its payload.
pub fn decode(raw: &[u8]) -> Result<&[u8], FrameError> {
    if raw.len() <= FRAME_OVERHEAD {
        return Err(FrameError::InvalidLength {
            declared: raw.get(1).map(|&b| b as usize),
            actual: raw.len(),
        });
    }
    if raw[0] != START_BYTE {
        return Err(FrameError::InvalidStartByte(raw[0]));
    }

    let declared = raw[1] as usize;
    if declared != raw.len() - FRAME_OVERHEAD {
        return Err(FrameError::InvalidLength {
            declared: Some(declared),
            actual: raw.len(),
        });
    }

    let payload = &raw[2..2 + declared];
    let received = u16::from_be_bytes([raw[2 + declared], raw[3 + declared]]);
    let expected = crc16(payload);
    if expected != received {
        return Err(FrameError::InvalidCrc { expected, received });
    }

    trace!("Valid frame, payload {:02X?}", payload);
    Ok(payload)
}

/// Reassembles frames from notification chunks.
///
/// A response larger than the negotiated MTU arrives as several
/// notifications. Chunks are buffered until `declared + 5` bytes follow a
/// start marker and the candidate passes [`decode`]. Bytes preceding a start
/// marker are discarded.
///
/// A rejected candidate only costs its start marker: the buffer is rescanned
/// from the next byte, so a corrupted length or a stray `0x02` never takes
/// the frames behind it down too. An incomplete candidate is abandoned as
/// soon as a later start marker already holds a valid frame with its end
/// marker in place.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every valid frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.buffer.iter().position(|&b| b == START_BYTE) {
                Some(0) => {}
                Some(skip) => {
                    trace!("Discarding {} bytes before start marker", skip);
                    self.buffer.drain(..skip);
                }
                None => {
                    self.buffer.clear();
                    break;
                }
            }

            if self.buffer.len() < 2 {
                break;
            }
            let total = self.buffer[1] as usize + FRAME_OVERHEAD;
            if self.buffer.len() >= total {
                match decode(&self.buffer[..total]) {
                    Ok(_) => frames.push(self.buffer.drain(..total).collect()),
                    Err(e) => {
                        warn!("Resyncing after rejected frame: {}", e);
                        self.buffer.drain(..1);
                    }
                }
                continue;
            }

            match self.valid_frame_after_head() {
                Some(next) => {
                    warn!("Abandoning incomplete frame of {} bytes", total);
                    self.buffer.drain(..next);
                }
                None => break,
            }
        }

        frames
    }

    /// Offset of the first later start marker that already begins a
    /// complete, valid frame. The end marker is required here: zero-filled
    /// payloads easily contain short runs that pass the CRC on their own.
    fn valid_frame_after_head(&self) -> Option<usize> {
        (1..self.buffer.len()).find(|&i| {
            self.buffer[i] == START_BYTE
                && self.buffer.get(i + 1).is_some_and(|&len| {
                    let end = i + len as usize + FRAME_OVERHEAD;
                    end <= self.buffer.len()
                        && self.buffer[end - 1] == END_BYTE
                        && decode(&self.buffer[i..end]).is_ok()
                })
        })
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
