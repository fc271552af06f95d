//! Core error types for meshsh

use msh_protocol::ProtocolError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{DestinationHash, IdentityHash};

/// Top-level error type for the meshsh crates
#[derive(Error, Debug)]
pub enum MshError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors establishing a session with a listener
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// No link could be established in time
    #[error("Timed out after {0:?} establishing a link")]
    ConnectTimeout(Duration),

    /// The listener did not answer the session request in time
    #[error("Timed out after {0:?} waiting for the session to start")]
    RequestTimeout(Duration),

    /// The listener refused the session
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The link went away
    #[error("Link lost: {0}")]
    LinkLost(String),
}

/// Errors raised while a session is running
#[derive(Error, Debug)]
pub enum SessionError {
    /// Too many malformed frames arrived within the window
    #[error("{count} malformed frames within {window:?}")]
    MalformedStorm { count: usize, window: Duration },

    /// No frame arrived within the liveness timeout
    #[error("No frames received for {0:?}")]
    KeepaliveTimeout(Duration),

    /// The link closed underneath the session
    #[error("Link closed")]
    LinkClosed,

    /// The session already reported an exit status
    #[error("Exit status already sent")]
    ExitAlreadySent,

    /// The session has shut down
    #[error("Session closed")]
    Closed,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An identity hash string is not 32 hex characters
    #[error("Invalid identity hash {value:?}: {reason}")]
    InvalidHash { value: String, reason: String },

    /// Identity file could not be read or written
    #[error("Identity file {path}: {reason}")]
    Identity { path: PathBuf, reason: String },
}

/// Errors from a transport or link
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link is closed
    #[error("Link closed")]
    Closed,

    /// A message exceeds the link MTU
    #[error("Message of {size} bytes exceeds link MTU of {mtu} bytes")]
    MessageTooLarge { size: usize, mtu: usize },

    /// No route to the destination is known
    #[error("Unknown destination {0}")]
    UnknownDestination(DestinationHash),

    /// The remote end did not prove the identity behind the destination
    #[error("Destination {destination} is not served by identity {presented}")]
    IdentityMismatch {
        destination: DestinationHash,
        presented: IdentityHash,
    },

    /// Link establishment handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Transport settings are unusable
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// The transport is not bound to a destination
    #[error("Transport is not listening")]
    NotListening,

    /// The transport was shut down
    #[error("Transport shut down")]
    Shutdown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using MshError
pub type Result<T> = std::result::Result<T, MshError>;
