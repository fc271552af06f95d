//! Listener configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::types::IdentityHash;

/// Configuration for `meshsh listen`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Service name the destination is derived from
    pub service_name: String,

    /// Identity file (defaults to `identity_listener` in the config dir)
    pub identity_path: Option<PathBuf>,

    /// Identity hashes allowed to connect
    pub allowed: Vec<String>,

    /// Accept any peer, identified or not
    pub no_auth: bool,

    /// Announce the destination on startup and periodically
    pub announce: bool,

    /// Interval between announces
    #[serde(with = "duration_secs")]
    pub announce_interval: Duration,

    /// How long an admitted peer has to send its session request
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Program and arguments to run for each session (empty = login shell)
    pub program: Vec<String>,

    /// TERM for the child when the client sends none
    pub default_term: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            service_name: "default".to_string(),
            identity_path: None,
            allowed: vec![],
            no_auth: false,
            announce: true,
            announce_interval: Duration::from_secs(900),
            request_timeout: Duration::from_secs(15),
            program: vec![],
            default_term: "xterm-256color".to_string(),
        }
    }
}

impl ListenerConfig {
    /// Parse the allow-list entries
    pub fn allowed_identities(&self) -> Result<Vec<IdentityHash>, ConfigError> {
        self.allowed.iter().map(|entry| entry.parse()).collect()
    }

    /// Program and arguments to run, falling back to the user's shell
    pub fn program_and_args(&self) -> (String, Vec<String>) {
        match self.program.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
                (shell, vec!["-l".to_string()])
            }
        }
    }
}
