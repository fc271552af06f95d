//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for `meshsh connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity file (defaults to `identity` in the config dir)
    pub identity_path: Option<PathBuf>,

    /// Connect without identifying to the listener
    pub no_identify: bool,

    /// Exit with the remote program's exit code
    pub mirror: bool,

    /// Time allowed to establish the link
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Time allowed for the listener to start the program
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Retransmit schedule for the session request
    pub retry: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity_path: None,
            no_identify: false,
            mirror: false,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(15),
            retry: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
