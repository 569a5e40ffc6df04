//! Inner stream sub-frames and their reassembly.
//!
//! Sub-frames ride inside `DATA`-flagged transport frames (and as the
//! SYN payload). The underlying transport preserves message boundaries
//! but the sender is free to split one sub-frame across two messages or
//! pack several into one, so every stream keeps a [`Reassembler`].
//!
//! Wire layout: `[opcode: u8][stream_id: u32 BE][length: u32 BE][payload]`.

use bytes::{Buf, Bytes, BytesMut};

use crate::FrameError;

/// Size of the sub-frame header.
pub const SUBFRAME_HEADER_LEN: usize = 9;

/// Sanity cap on a single sub-frame payload. Anything larger is treated
/// as a corrupt header, not a legitimate frame.
pub const MAX_SUBFRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Sub-frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Stream open; payload carries the routing kind and initial bytes.
    Open = 0x80,
    /// Application data.
    Data = 0x81,
    /// Close notice accompanying a graceful FIN.
    Close = 0x82,
    /// Terminal geometry change (PTY-like streams). Payload is
    /// `[cols: u32 BE][rows: u32 BE]`.
    Resize = 0x83,
    /// Progress report, JSON-encoded.
    Progress = 0x84,
    /// Terminal call outcome, JSON-encoded.
    Result = 0x85,
    /// Cancel the underlying operation; precedes an RST.
    Abort = 0x86,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(Self::Open),
            0x81 => Some(Self::Data),
            0x82 => Some(Self::Close),
            0x83 => Some(Self::Resize),
            0x84 => Some(Self::Progress),
            0x85 => Some(Self::Result),
            0x86 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// One decoded sub-frame.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub opcode: Opcode,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl StreamFrame {
    pub fn new(opcode: Opcode, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            stream_id,
            payload: payload.into(),
        }
    }

    /// Encode into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SUBFRAME_HEADER_LEN + self.payload.len());
        out.push(self.opcode as u8);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Encode the Open sub-frame payload: the stream kind followed by the
/// caller's initial bytes, NUL-separated. The kind is what the relay
/// routes on.
pub fn encode_open_payload(kind: &str, initial: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(kind.len() + 1 + initial.len());
    out.extend_from_slice(kind.as_bytes());
    out.push(0);
    out.extend_from_slice(initial);
    out
}

/// Split an Open sub-frame payload back into `(kind, initial)`.
pub fn decode_open_payload(payload: &[u8]) -> Option<(String, Bytes)> {
    let sep = payload.iter().position(|b| *b == 0)?;
    let kind = std::str::from_utf8(&payload[..sep]).ok()?.to_owned();
    Some((kind, Bytes::copy_from_slice(&payload[sep + 1..])))
}

/// Accumulates raw bytes from transport deliveries and yields complete
/// sub-frames, however the sender split or coalesced them.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one transport delivery.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered and not yet parsed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to parse the next complete sub-frame. Returns `Ok(None)` when
    /// fewer bytes than a full frame remain; call again after the next
    /// `push`. An error consumes the offending frame so parsing can
    /// continue behind it.
    pub fn next_frame(&mut self) -> Result<Option<StreamFrame>, FrameError> {
        if self.buf.len() < SUBFRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]);
        if len > MAX_SUBFRAME_PAYLOAD {
            // The length field is garbage; there is no way to resync.
            self.buf.clear();
            return Err(FrameError::Oversized {
                len,
                max: MAX_SUBFRAME_PAYLOAD,
            });
        }
        let total = SUBFRAME_HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total);
        let op_byte = frame[0];
        let stream_id = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        frame.advance(SUBFRAME_HEADER_LEN);

        let Some(opcode) = Opcode::from_u8(op_byte) else {
            return Err(FrameError::UnknownOpcode(op_byte));
        };

        Ok(Some(StreamFrame {
            opcode,
            stream_id,
            payload: frame.freeze(),
        }))
    }
}
