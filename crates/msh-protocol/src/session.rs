//! Link and session identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a transport link (16 bytes, assigned by the transport)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub [u8; 16]);

impl LinkId {
    /// Create a link ID from raw bytes
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; 16]> for LinkId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

/// Identifier of a session; one session per link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(LinkId);

impl SessionId {
    /// Session ID for the session bound to a link
    pub fn for_link(link: LinkId) -> Self {
        Self(link)
    }

    /// The link this session is bound to
    pub fn link(&self) -> LinkId {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0.short())
    }
}

impl From<LinkId> for SessionId {
    fn from(link: LinkId) -> Self {
        Self::for_link(link)
    }
}
