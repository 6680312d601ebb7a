//! Wire protocol for relay shell channels.
//!
//! Each session rides its own WebSocket. Text frames carry keystrokes
//! (client → relay) and terminal output (relay → client). Binary frames carry
//! typed control records, identified by their leading opcode byte:
//!
//! - `[0x01][cols: u16 big-endian][rows: u16 big-endian]`: resize
//!
//! Every other leading byte is reserved.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Opcode byte values for binary control records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Resize = 0x01,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Resize),
            _ => None,
        }
    }
}

/// Exact length of an encoded resize record.
pub const RESIZE_FRAME_LEN: usize = 5;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// A single message on a session channel, independent of the WebSocket
/// library carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Interpret an incoming frame as terminal output.
    ///
    /// Relays may deliver output in binary frames; those bytes are decoded
    /// lossily since recordings and sinks are text based.
    pub fn into_output(self) -> String {
        match self {
            Frame::Text(text) => text,
            Frame::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty binary frame")]
    Empty,
    #[error("reserved opcode: 0x{0:02x}")]
    ReservedOpcode(u8),
    #[error("bad length for resize record: {0} bytes (expected 5)")]
    BadLength(usize),
}

/// Client → relay messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Keystrokes or pasted text.
    Input(String),
    /// Terminal geometry change.
    Resize(Geometry),
}

impl ControlMessage {
    /// Build an input message from raw bytes typed by the operator.
    pub fn input(data: &[u8]) -> Self {
        Self::Input(String::from_utf8_lossy(data).into_owned())
    }

    pub fn encode(&self) -> Frame {
        match self {
            ControlMessage::Input(text) => Frame::Text(text.clone()),
            ControlMessage::Resize(geometry) => Frame::Binary(encode_resize(*geometry)),
        }
    }

    /// Decode a frame as sent by a client. Used by relay-side code and tests.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame {
            Frame::Text(text) => Ok(Self::Input(text.clone())),
            Frame::Binary(data) => decode_resize(data).map(Self::Resize),
        }
    }
}

/// Encode a resize record: `[0x01, colsHi, colsLo, rowsHi, rowsLo]`.
pub fn encode_resize(geometry: Geometry) -> Bytes {
    let mut buf = BytesMut::with_capacity(RESIZE_FRAME_LEN);
    buf.put_u8(Opcode::Resize as u8);
    buf.put_u16(geometry.cols);
    buf.put_u16(geometry.rows);
    buf.freeze()
}

/// Decode a binary control record, rejecting reserved opcodes.
pub fn decode_resize(mut data: &[u8]) -> Result<Geometry, ProtocolError> {
    let Some(&first) = data.first() else {
        return Err(ProtocolError::Empty);
    };
    if Opcode::from_u8(first).is_none() {
        return Err(ProtocolError::ReservedOpcode(first));
    }
    if data.len() != RESIZE_FRAME_LEN {
        return Err(ProtocolError::BadLength(data.len()));
    }
    data.advance(1);
    let cols = data.get_u16();
    let rows = data.get_u16();
    Ok(Geometry { cols, rows })
}
