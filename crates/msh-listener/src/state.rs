//! Shared listener context

use msh_core::config::{ListenerConfig, SessionConfig};
use msh_core::error::ConfigError;

use crate::auth::Authenticator;

/// Read-only settings shared by every session of a listener
#[derive(Debug)]
pub struct ListenerContext {
    /// Listener configuration
    pub config: ListenerConfig,
    /// Per-session tunables
    pub session: SessionConfig,
    /// Admission policy
    pub auth: Authenticator,
    program: String,
    args: Vec<String>,
}

impl ListenerContext {
    /// Build the context, validating the allow-list and session settings
    pub fn new(config: ListenerConfig, session: SessionConfig) -> Result<Self, ConfigError> {
        session.validate()?;
        let auth = Authenticator::from_config(&config)?;
        let (program, args) = config.program_and_args();
        Ok(Self {
            config,
            session,
            auth,
            program,
            args,
        })
    }

    /// Use a specific admission policy
    pub fn with_auth(mut self, auth: Authenticator) -> Self {
        self.auth = auth;
        self
    }

    /// Program run for each session
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}
