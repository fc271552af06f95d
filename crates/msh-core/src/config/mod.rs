//! Configuration management for meshsh
//!
//! One TOML file holds a section per concern. Every section has defaults,
//! so an empty or missing file is a valid configuration.

mod client;
mod listener;
pub mod serde_utils;
mod session;
mod transport;

pub use client::{BackoffConfig, ClientConfig};
pub use listener::ListenerConfig;
pub use session::SessionConfig;
pub use transport::{TransportConfig, MIN_MTU};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Complete configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub listener: ListenerConfig,
    pub client: ClientConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
}

impl ConfigFile {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        self.transport.validate()?;
        self.listener.allowed_identities()?;
        Ok(())
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshsh")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load configuration, falling back to defaults when the file does not exist
pub fn load_or_default(path: &Path) -> Result<ConfigFile, ConfigError> {
    match load_config::<ConfigFile>(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::NotFound(_)) => Ok(ConfigFile::default()),
        Err(e) => Err(e),
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
