//! Message codec for session frames
//!
//! A link delivers whole messages, so a frame is always encoded into and
//! decoded from exactly one message. The codec is parameterised by the link
//! MTU and refuses to produce a message larger than it.

use bytes::{Bytes, BytesMut};

use crate::error::{MalformedFrame, ProtocolError};
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::{Control, FrameType, StreamKind};

/// A complete frame with header fields and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Sequence number within the frame type
    pub seq: u32,
    /// Raw payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, seq: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            seq,
            payload,
        }
    }

    /// Create a data frame for a stream
    pub fn data(stream: StreamKind, seq: u32, payload: Bytes) -> Self {
        Self::new(stream.frame_type(), seq, payload)
    }

    /// Create a control frame with a serialized payload
    pub fn control(control: &Control, seq: u32) -> Result<Self, ProtocolError> {
        let payload = control.encode_payload()?;
        Ok(Self::new(control.frame_type(), seq, Bytes::from(payload)))
    }

    /// Parse the payload of a control frame
    pub fn to_control(&self) -> Result<Control, MalformedFrame> {
        Control::decode_payload(self.frame_type, &self.payload)
    }

    /// Size of this frame once encoded
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Codec for encoding/decoding frames against a link MTU
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    mtu: usize,
}

impl FrameCodec {
    /// Create a codec for a link with the given MTU
    ///
    /// The MTU must leave room for at least one payload byte.
    pub fn new(mtu: usize) -> Result<Self, ProtocolError> {
        if mtu <= HEADER_SIZE {
            return Err(ProtocolError::MtuTooSmall(mtu));
        }
        Ok(Self { mtu })
    }

    /// Link MTU this codec was built for
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest payload that fits in one frame
    pub fn max_payload(&self) -> usize {
        (self.mtu - HEADER_SIZE).min(MAX_PAYLOAD_SIZE)
    }

    /// Encode a frame into one transport message
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let size = frame.encoded_len();
        if size > self.mtu || frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                mtu: self.mtu,
            });
        }

        let header = FrameHeader::new(frame.frame_type, frame.seq, frame.payload.len() as u16);
        let mut dst = BytesMut::with_capacity(size);
        header.encode(&mut dst);
        dst.extend_from_slice(&frame.payload);

        Ok(dst.freeze())
    }

    /// Decode one transport message into a frame
    pub fn decode(&self, message: &[u8]) -> Result<Frame, ProtocolError> {
        let header = FrameHeader::decode(message)?;
        let payload = Bytes::copy_from_slice(&message[HEADER_SIZE..]);

        Ok(Frame {
            frame_type: header.frame_type,
            seq: header.seq,
            payload,
        })
    }
}
