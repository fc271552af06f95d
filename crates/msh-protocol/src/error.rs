//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The message could not be parsed as a frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] MalformedFrame),

    /// Encoded frame would not fit in one transport message
    #[error("Frame too large: {size} bytes exceeds link MTU of {mtu} bytes")]
    FrameTooLarge { size: usize, mtu: usize },

    /// The link MTU cannot hold a header plus at least one payload byte
    #[error("MTU of {0} bytes is too small for framing")]
    MtuTooSmall(usize),

    /// A control payload failed to serialize
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// The specific reason a frame was rejected by the decoder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedFrame {
    /// Unknown frame type tag
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),

    /// Message is shorter than a frame header
    #[error("message of {0} bytes is shorter than the frame header")]
    Truncated(usize),

    /// Declared payload length disagrees with the message
    #[error("declared payload of {declared} bytes, message carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// A control payload did not deserialize into its type
    #[error("invalid {frame_type} payload: {reason}")]
    InvalidPayload {
        frame_type: &'static str,
        reason: String,
    },

    /// The frame type does not carry the requested payload
    #[error("{0} frames carry no control payload")]
    NotControl(&'static str),
}

impl ProtocolError {
    /// Whether this error describes a bad inbound frame
    pub fn is_malformed(&self) -> bool {
        matches!(self, ProtocolError::MalformedFrame(_))
    }
}
