//! Outer transport frame: the envelope that crosses the physical
//! connection.
//!
//! Wire layout: `[stream_id: u32 BE][flags: u8][payload...]`.

use bitflags::bitflags;
use bytes::Bytes;

use crate::FrameError;

/// Size of the transport frame header.
pub const FRAME_HEADER_LEN: usize = 5;

bitflags! {
    /// Flags carried in each transport frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// Opens a stream. The payload is an Open sub-frame.
        const SYN  = 0x01;
        /// Frame carries sub-frame bytes.
        const DATA = 0x04;
        /// Graceful close of the stream.
        const FIN  = 0x08;
        /// Hard abort of the stream.
        const RST  = 0x10;
    }
}

/// One transport frame, owned.
#[derive(Debug, Clone)]
pub struct TransportFrame {
    pub stream_id: u32,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl TransportFrame {
    pub fn new(stream_id: u32, flags: FrameFlags, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            flags,
            payload: payload.into(),
        }
    }

    /// Encode into a single wire message.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.push(self.flags.bits());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one wire message. Anything shorter than the header is a
    /// protocol violation and is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated { len: bytes.len() });
        }
        let stream_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        // Unknown flag bits are ignored rather than rejected.
        let flags = FrameFlags::from_bits_truncate(bytes[4]);
        Ok(Self {
            stream_id,
            flags,
            payload: Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let frame = TransportFrame::new(7, FrameFlags::DATA, &b"hello"[..]);
        let decoded = TransportFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.flags, FrameFlags::DATA);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn short_frame_rejected() {
        assert!(matches!(
            TransportFrame::decode(&[0, 0, 0, 1]),
            Err(FrameError::Truncated { len: 4 })
        ));
    }

    #[test]
    fn empty_payload_is_fine() {
        let frame = TransportFrame::new(1, FrameFlags::FIN, Bytes::new());
        let decoded = TransportFrame::decode(&frame.encode()).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.flags, FrameFlags::FIN);
    }

    #[test]
    fn unknown_flag_bits_ignored() {
        let mut raw = TransportFrame::new(3, FrameFlags::DATA, Bytes::new()).encode();
        raw[4] |= 0x40;
        let decoded = TransportFrame::decode(&raw).unwrap();
        assert_eq!(decoded.flags, FrameFlags::DATA);
    }
}
