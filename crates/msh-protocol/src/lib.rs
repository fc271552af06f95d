//! msh-protocol: Frame format for meshsh sessions
//!
//! This crate defines the binary frames exchanged between a meshsh client
//! and listener. Every frame travels inside exactly one transport message,
//! so the codec works on whole messages rather than on a byte stream.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod session;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    Control, DegradedNotice, ExitReport, FrameType, OpenRequest, RemoteStatus, SignalKind,
    StreamKind, TerminalSize, PROTOCOL_VERSION,
};
pub use session::{LinkId, SessionId};
