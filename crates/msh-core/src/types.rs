//! Core domain types

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Length of identity and destination hashes in bytes
pub const HASH_LENGTH: usize = 16;

/// Length of the service name hash mixed into a destination
const NAME_HASH_LENGTH: usize = 10;

/// Prefix applied to service names before hashing
pub const APP_NAME: &str = "meshsh";

fn parse_hash(value: &str) -> Result<[u8; HASH_LENGTH], ConfigError> {
    let trimmed = value.trim().trim_start_matches('<').trim_end_matches('>');
    if trimmed.len() != HASH_LENGTH * 2 {
        return Err(ConfigError::InvalidHash {
            value: value.to_string(),
            reason: format!(
                "expected {} hex characters, got {}",
                HASH_LENGTH * 2,
                trimmed.len()
            ),
        });
    }

    let mut bytes = [0u8; HASH_LENGTH];
    hex::decode_to_slice(trimmed, &mut bytes).map_err(|e| ConfigError::InvalidHash {
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    Ok(bytes)
}

/// Hash of a participant's public key, exchanged as 32 hex characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityHash(pub [u8; HASH_LENGTH]);

impl IdentityHash {
    /// Derive the hash of an ed25519 public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(&digest[..HASH_LENGTH]);
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for IdentityHash {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hash(s).map(Self)
    }
}

/// Address of a service announced by an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationHash(pub [u8; HASH_LENGTH]);

impl DestinationHash {
    /// Derive the destination for a service name under an identity
    ///
    /// `SHA-256(name_hash || identity_hash)[..16]` where `name_hash` is the
    /// first 10 bytes of `SHA-256("meshsh." + service)`.
    pub fn derive(service: &str, identity: &IdentityHash) -> Self {
        let name_digest = Sha256::digest(format!("{}.{}", APP_NAME, service).as_bytes());

        let mut hasher = Sha256::new();
        hasher.update(&name_digest[..NAME_HASH_LENGTH]);
        hasher.update(identity.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(&digest[..HASH_LENGTH]);
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }
}

impl fmt::Display for DestinationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for DestinationHash {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hash(s).map(Self)
    }
}

/// Listener-side session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerState {
    /// Not yet listening
    Idle,
    /// Announced and waiting for a link
    AwaitingLink,
    /// Link established, checking the peer identity
    Authenticating,
    /// Peer admitted, waiting for the session request
    Authenticated,
    /// Child process running
    Running,
    /// Session over, resources released
    Closed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Idle => write!(f, "idle"),
            ListenerState::AwaitingLink => write!(f, "awaiting-link"),
            ListenerState::Authenticating => write!(f, "authenticating"),
            ListenerState::Authenticated => write!(f, "authenticated"),
            ListenerState::Running => write!(f, "running"),
            ListenerState::Closed => write!(f, "closed"),
        }
    }
}

/// Client-side session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    /// Not yet connecting
    Idle,
    /// Establishing the link
    Connecting,
    /// Link up, waiting for the listener to start the program
    Requesting,
    /// Program running, terminal attached
    Active,
    /// Session over
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Idle => write!(f, "idle"),
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Requesting => write!(f, "requesting"),
            ClientState::Active => write!(f, "active"),
            ClientState::Closed => write!(f, "closed"),
        }
    }
}
