//! Frame types and typed control payloads
//!
//! Data frames (`StdinData`, `StdoutData`, `StderrData`) carry raw bytes.
//! Every other frame is a control frame whose payload is a bincode-encoded
//! value described here.
//!
//! # Session flow
//!
//! 1. Client sends `Open` (retransmitted until answered)
//! 2. Listener answers `Ready` with the child pid, or `Refused`
//! 3. Data frames flow in both directions; `Resize` and `Signal` go client → listener
//! 4. Listener sends one `ExitStatus` when the child ends
//! 5. Client sends `Disconnect`; either side may close the link
//!
//! `Keepalive` frames are sent by both sides whenever the link is otherwise idle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MalformedFrame;

/// Session protocol version carried in `Open`
pub const PROTOCOL_VERSION: u16 = 1;

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Client keystrokes for the child's terminal
    StdinData = 0x01,
    /// Child terminal output
    StdoutData = 0x02,
    /// Listener-side diagnostics for the client's stderr
    StderrData = 0x03,
    /// Terminal size change
    Resize = 0x10,
    /// Signal to deliver to the child's foreground process group
    Signal = 0x11,
    /// Child exit status, sent once
    ExitStatus = 0x12,
    /// Session request from the client
    Open = 0x20,
    /// Session accepted, child running
    Ready = 0x21,
    /// Session refused
    Refused = 0x22,
    /// Peer detected unrecoverable loss on a data stream
    Degraded = 0x23,
    /// Orderly session teardown
    Disconnect = 0x24,
    /// Liveness check
    Keepalive = 0x30,
}

impl FrameType {
    /// All frame types, in tag order
    pub const ALL: [FrameType; 12] = [
        FrameType::StdinData,
        FrameType::StdoutData,
        FrameType::StderrData,
        FrameType::Resize,
        FrameType::Signal,
        FrameType::ExitStatus,
        FrameType::Open,
        FrameType::Ready,
        FrameType::Refused,
        FrameType::Degraded,
        FrameType::Disconnect,
        FrameType::Keepalive,
    ];

    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::StdinData),
            0x02 => Some(Self::StdoutData),
            0x03 => Some(Self::StderrData),
            0x10 => Some(Self::Resize),
            0x11 => Some(Self::Signal),
            0x12 => Some(Self::ExitStatus),
            0x20 => Some(Self::Open),
            0x21 => Some(Self::Ready),
            0x22 => Some(Self::Refused),
            0x23 => Some(Self::Degraded),
            0x24 => Some(Self::Disconnect),
            0x30 => Some(Self::Keepalive),
            _ => None,
        }
    }

    /// Whether frames of this type carry raw stream bytes
    pub fn is_data(&self) -> bool {
        self.stream().is_some()
    }

    /// The data stream carried by this frame type, if any
    pub fn stream(&self) -> Option<StreamKind> {
        match self {
            Self::StdinData => Some(StreamKind::Stdin),
            Self::StdoutData => Some(StreamKind::Stdout),
            Self::StderrData => Some(StreamKind::Stderr),
            _ => None,
        }
    }

    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::StdinData => "stdin",
            Self::StdoutData => "stdout",
            Self::StderrData => "stderr",
            Self::Resize => "resize",
            Self::Signal => "signal",
            Self::ExitStatus => "exit-status",
            Self::Open => "open",
            Self::Ready => "ready",
            Self::Refused => "refused",
            Self::Degraded => "degraded",
            Self::Disconnect => "disconnect",
            Self::Keepalive => "keepalive",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A byte stream carried by data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Frame type used to carry this stream
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Stdin => FrameType::StdinData,
            Self::Stdout => FrameType::StdoutData,
            Self::Stderr => FrameType::StderrData,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.frame_type().name())
    }
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Default terminal size (24x80)
    pub fn default_size() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Signals a client may forward to the remote program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Interrupt,
    Terminate,
    Hangup,
    Kill,
    Quit,
    Suspend,
    Continue,
}

impl SignalKind {
    /// Conventional signal name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
            Self::Kill => "SIGKILL",
            Self::Quit => "SIGQUIT",
            Self::Suspend => "SIGTSTP",
            Self::Continue => "SIGCONT",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the remote program ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    /// Exited normally with a code
    Exited(i32),
    /// Terminated by a signal (signal name)
    Signaled(String),
    /// The program could not be started
    SpawnFailed(String),
    /// No pseudo-terminal could be allocated
    PtyAllocationFailed(String),
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(name) => write!(f, "terminated by {}", name),
            Self::SpawnFailed(reason) => write!(f, "spawn failed: {}", reason),
            Self::PtyAllocationFailed(reason) => write!(f, "PTY allocation failed: {}", reason),
        }
    }
}

/// Payload of the `ExitStatus` frame
///
/// The frame counts let the receiver wait for output still in flight
/// before reporting the exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub status: RemoteStatus,
    /// Number of `StdoutData` frames sent before this report
    pub stdout_frames: u32,
    /// Number of `StderrData` frames sent before this report
    pub stderr_frames: u32,
}

impl ExitReport {
    /// Report with no preceding output
    pub fn new(status: RemoteStatus) -> Self {
        Self {
            status,
            stdout_frames: 0,
            stderr_frames: 0,
        }
    }
}

/// Payload of the `Open` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Value for the child's TERM variable
    pub term: Option<String>,
    /// Initial terminal size
    pub size: TerminalSize,
    /// Client protocol version
    pub version: u16,
}

impl OpenRequest {
    pub fn new(term: Option<String>, size: TerminalSize) -> Self {
        Self {
            term,
            size,
            version: PROTOCOL_VERSION,
        }
    }
}

/// Payload of the `Degraded` frame: what the sender had to give up on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradedNotice {
    /// An inclusive range of sequence numbers of one stream
    Lost {
        stream: StreamKind,
        first_lost: u32,
        last_lost: u32,
    },
    /// A frame that could not be decoded; `count` within the malformed window
    Malformed { count: u32 },
}

impl fmt::Display for DegradedNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lost {
                stream,
                first_lost,
                last_lost,
            } => write!(f, "lost {} frames {}..={}", stream, first_lost, last_lost),
            Self::Malformed { count } => write!(f, "dropped malformed frame ({} in window)", count),
        }
    }
}

/// Decoded control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Resize(TerminalSize),
    Signal(SignalKind),
    Exit(ExitReport),
    Open(OpenRequest),
    Ready { pid: u32 },
    Refused { reason: String },
    Degraded(DegradedNotice),
    Disconnect,
    Keepalive,
}

impl Control {
    /// Frame type that carries this control value
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Resize(_) => FrameType::Resize,
            Self::Signal(_) => FrameType::Signal,
            Self::Exit(_) => FrameType::ExitStatus,
            Self::Open(_) => FrameType::Open,
            Self::Ready { .. } => FrameType::Ready,
            Self::Refused { .. } => FrameType::Refused,
            Self::Degraded(_) => FrameType::Degraded,
            Self::Disconnect => FrameType::Disconnect,
            Self::Keepalive => FrameType::Keepalive,
        }
    }

    /// Free-text part of the payload, if any
    fn reason_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::Refused { reason } => Some(reason),
            Self::Exit(report) => match &mut report.status {
                RemoteStatus::Signaled(text)
                | RemoteStatus::SpawnFailed(text)
                | RemoteStatus::PtyAllocationFailed(text) => Some(text),
                RemoteStatus::Exited(_) => None,
            },
            _ => None,
        }
    }

    /// Shorten the free-text reason until the payload fits `max_payload` bytes
    ///
    /// Payloads without free text are left as they are.
    pub fn fit_payload(&mut self, max_payload: usize) {
        let Ok(payload) = self.encode_payload() else {
            return;
        };
        let excess = payload.len().saturating_sub(max_payload);
        if excess == 0 {
            return;
        }
        if let Some(text) = self.reason_mut() {
            let mut end = text.len().saturating_sub(excess);
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
    }

    /// Serialize the payload; `Disconnect` and `Keepalive` are empty
    pub fn encode_payload(&self) -> Result<Vec<u8>, bincode::Error> {
        match self {
            Self::Resize(size) => bincode::serialize(size),
            Self::Signal(kind) => bincode::serialize(kind),
            Self::Exit(report) => bincode::serialize(report),
            Self::Open(request) => bincode::serialize(request),
            Self::Ready { pid } => bincode::serialize(pid),
            Self::Refused { reason } => bincode::serialize(reason),
            Self::Degraded(notice) => bincode::serialize(notice),
            Self::Disconnect | Self::Keepalive => Ok(Vec::new()),
        }
    }

    /// Parse the payload of a control frame
    pub fn decode_payload(frame_type: FrameType, payload: &[u8]) -> Result<Self, MalformedFrame> {
        let invalid = |e: bincode::Error| MalformedFrame::InvalidPayload {
            frame_type: frame_type.name(),
            reason: e.to_string(),
        };

        let control = match frame_type {
            FrameType::Resize => Self::Resize(bincode::deserialize(payload).map_err(invalid)?),
            FrameType::Signal => Self::Signal(bincode::deserialize(payload).map_err(invalid)?),
            FrameType::ExitStatus => Self::Exit(bincode::deserialize(payload).map_err(invalid)?),
            FrameType::Open => Self::Open(bincode::deserialize(payload).map_err(invalid)?),
            FrameType::Ready => Self::Ready {
                pid: bincode::deserialize(payload).map_err(invalid)?,
            },
            FrameType::Refused => Self::Refused {
                reason: bincode::deserialize(payload).map_err(invalid)?,
            },
            FrameType::Degraded => {
                Self::Degraded(bincode::deserialize(payload).map_err(invalid)?)
            }
            FrameType::Disconnect | FrameType::Keepalive => {
                if !payload.is_empty() {
                    return Err(MalformedFrame::InvalidPayload {
                        frame_type: frame_type.name(),
                        reason: format!("expected empty payload, got {} bytes", payload.len()),
                    });
                }
                if frame_type == FrameType::Disconnect {
                    Self::Disconnect
                } else {
                    Self::Keepalive
                }
            }
            FrameType::StdinData | FrameType::StdoutData | FrameType::StderrData => {
                return Err(MalformedFrame::NotControl(frame_type.name()));
            }
        };

        Ok(control)
    }
}
