//! TCP transport configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::types::DestinationHash;

/// Smallest MTU that still leaves room for control payloads
pub const MIN_MTU: usize = 64;

/// Configuration for the TCP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the listener binds to
    pub bind_address: String,

    /// Maximum message size on a link
    pub mtu: usize,

    /// UDP port used for announces and path requests
    pub discovery_port: u16,

    /// Broadcast address for path requests and announces
    pub broadcast_address: String,

    /// Time allowed for a path request to be answered
    #[serde(with = "duration_secs")]
    pub path_timeout: Duration,

    /// Time allowed for the link handshake
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Static routes: destination hash to `host:port`
    pub destinations: HashMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4242".to_string(),
            mtu: 1024,
            discovery_port: 4243,
            broadcast_address: "255.255.255.255".to_string(),
            path_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            destinations: HashMap::new(),
        }
    }
}

impl TransportConfig {
    /// Parse the static route table
    pub fn static_routes(&self) -> Result<HashMap<DestinationHash, String>, ConfigError> {
        self.destinations
            .iter()
            .map(|(hash, addr)| Ok((hash.parse()?, addr.clone())))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < MIN_MTU || self.mtu > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "transport.mtu must be between {} and {}",
                MIN_MTU,
                u16::MAX
            )));
        }
        self.static_routes()?;
        Ok(())
    }
}
