//! Session tunables shared by listener and client

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Per-session flow control, ordering and liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time before a keepalive frame is sent
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Link is dead after this many keepalive intervals without a frame
    pub keepalive_timeout_multiple: u32,

    /// How long a sequence gap may stay open before it is declared lost
    #[serde(with = "duration_millis")]
    pub reorder_wait: Duration,

    /// Out-of-order frames buffered per stream
    pub reorder_window: usize,

    /// Chunks of unsent data allowed to queue before producers pause
    pub data_window: usize,

    /// Malformed frames tolerated within `malformed_window`
    pub malformed_limit: usize,

    #[serde(with = "duration_secs")]
    pub malformed_window: Duration,

    /// Minimum spacing between outbound resize frames
    #[serde(with = "duration_millis")]
    pub resize_coalesce: Duration,

    /// How long queued output may take to flush once the child exits
    #[serde(with = "duration_millis")]
    pub exit_drain_timeout: Duration,

    /// How long the listener waits for the client to disconnect after exit
    #[serde(with = "duration_secs")]
    pub linger: Duration,

    /// Bytes of decoded inbound data held for a slow sink before reads pause
    pub inbound_backlog_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout_multiple: 3,
            reorder_wait: Duration::from_secs(2),
            reorder_window: 64,
            data_window: 32,
            malformed_limit: 8,
            malformed_window: Duration::from_secs(5),
            resize_coalesce: Duration::from_millis(50),
            exit_drain_timeout: Duration::from_secs(1),
            linger: Duration::from_secs(5),
            inbound_backlog_limit: 1024 * 1024,
        }
    }
}

impl SessionConfig {
    /// Silence after which the link is considered dead
    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_interval * self.keepalive_timeout_multiple
    }

    /// Check for values that would stall or disable a session
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "session.keepalive_interval must be positive".into(),
            ));
        }
        if self.keepalive_timeout_multiple < 2 {
            return Err(ConfigError::Invalid(
                "session.keepalive_timeout_multiple must be at least 2".into(),
            ));
        }
        if self.reorder_window == 0 || self.data_window == 0 {
            return Err(ConfigError::Invalid(
                "session.reorder_window and session.data_window must be positive".into(),
            ));
        }
        if self.malformed_limit == 0 {
            return Err(ConfigError::Invalid(
                "session.malformed_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}
