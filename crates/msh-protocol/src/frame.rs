//! Frame header encoding/decoding
//!
//! The frame format uses a 7-byte header:
//! - frame_type: 1 byte (u8)
//! - sequence: 4 bytes (u32, big-endian, per frame type)
//! - payload_length: 2 bytes (u16, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::MalformedFrame;
use crate::message::FrameType;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 7;

/// Maximum payload size representable by the 16-bit length field
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame header carrying type, ordering and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of the frame
    pub frame_type: FrameType,
    /// Sequence number within the frame type
    pub seq: u32,
    /// Length of the payload in bytes
    pub payload_length: u16,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(frame_type: FrameType, seq: u32, payload_length: u16) -> Self {
        Self {
            frame_type,
            seq,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u32(self.seq);
        dst.put_u16(self.payload_length);
    }

    /// Decode a header from the front of a complete message
    ///
    /// The message must contain exactly the header followed by the
    /// declared payload; anything else is malformed.
    pub fn decode(message: &[u8]) -> Result<Self, MalformedFrame> {
        if message.len() < HEADER_SIZE {
            return Err(MalformedFrame::Truncated(message.len()));
        }

        let mut src = message;
        let type_byte = src.get_u8();
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(MalformedFrame::UnknownType(type_byte))?;
        let seq = src.get_u32();
        let payload_length = src.get_u16();

        if src.remaining() != payload_length as usize {
            return Err(MalformedFrame::LengthMismatch {
                declared: payload_length as usize,
                actual: src.remaining(),
            });
        }

        Ok(Self {
            frame_type,
            seq,
            payload_length,
        })
    }
}
