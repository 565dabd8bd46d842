//! Frame header layout.
//!
//! ```text
//! 0      2         3      4             8
//! +------+---------+------+-------------+---------------------+
//! | "FX" | version | kind | length (LE) | payload (length B)  |
//! +------+---------+------+-------------+---------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

pub const HEADER_SIZE: usize = 8;

pub const MAGIC: [u8; 2] = *b"FX";

/// Header version written by this build.
pub const FRAME_VERSION: u8 = 1;

/// Default cap on one frame's payload: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Limits applied while reading and writing frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub len: u32,
}

impl FrameHeader {
    /// Parse and validate a header. The payload length is checked against
    /// `max_payload` before anything is allocated for it.
    pub fn decode(raw: &[u8; HEADER_SIZE], max_payload: usize) -> Result<Self> {
        let magic = [raw[0], raw[1]];
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }
        if raw[2] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(raw[2]));
        }
        let kind = FrameKind::try_from(raw[3])?;
        let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if len as usize > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: len as usize,
                max: max_payload,
            });
        }
        Ok(Self { kind, len })
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_slice(&MAGIC);
        dst.put_u8(FRAME_VERSION);
        dst.put_u8(self.kind as u8);
        dst.put_u32_le(self.len);
    }
}

/// One provider frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append header and payload to `dst`.
    pub fn encode(&self, dst: &mut BytesMut, max_payload: usize) -> Result<()> {
        let size = self.payload.len();
        let len = u32::try_from(size)
            .ok()
            .filter(|_| size <= max_payload)
            .ok_or(FrameError::PayloadTooLarge {
                size,
                max: max_payload.min(u32::MAX as usize),
            })?;
        dst.reserve(self.wire_size());
        FrameHeader {
            kind: self.kind,
            len,
        }
        .put(dst);
        dst.put_slice(&self.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(frame: &Frame) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        buf[..HEADER_SIZE].try_into().unwrap()
    }

    #[test]
    fn header_layout() {
        let frame = Frame::new(FrameKind::Data, Bytes::from_static(b"hello"));
        let raw = header_bytes(&frame);
        assert_eq!(&raw[..2], b"FX");
        assert_eq!(raw[2], FRAME_VERSION);
        assert_eq!(raw[3], FrameKind::Data as u8);
        assert_eq!(&raw[4..], &5u32.to_le_bytes());
        assert_eq!(frame.wire_size(), HEADER_SIZE + 5);

        let header = FrameHeader::decode(&raw, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(header, FrameHeader { kind: FrameKind::Data, len: 5 });
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut raw = header_bytes(&Frame::new(FrameKind::Ack, Bytes::new()));
        raw[2] = 9;
        assert!(matches!(
            FrameHeader::decode(&raw, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::UnsupportedVersion(9))
        ));
        raw[0] = 0;
        assert!(matches!(
            FrameHeader::decode(&raw, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::InvalidMagic([0, b'X']))
        ));
    }

    #[test]
    fn declared_length_is_checked_before_reading() {
        let raw = header_bytes(&Frame::new(FrameKind::Data, vec![0u8; 64]));
        assert!(matches!(
            FrameHeader::decode(&raw, 63),
            Err(FrameError::PayloadTooLarge { size: 64, max: 63 })
        ));
    }

    #[test]
    fn encode_respects_limit() {
        let frame = Frame::new(FrameKind::Data, vec![0u8; 10]);
        let mut buf = BytesMut::new();
        assert!(frame.encode(&mut buf, 4).is_err());
        assert!(buf.is_empty());
    }
}
