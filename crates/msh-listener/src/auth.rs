//! Peer admission
//!
//! A listener admits peers whose proven identity hash is on its allow-list,
//! or every peer when authentication is disabled.

use std::collections::HashSet;

use msh_core::config::ListenerConfig;
use msh_core::error::ConfigError;
use msh_core::IdentityHash;
use thiserror::Error;

/// Why a peer was not admitted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The peer did not identify itself on the link
    #[error("peer did not identify")]
    NotIdentified,

    /// The peer's identity is not on the allow-list
    #[error("identity {0} is not allowed")]
    NotAllowed(IdentityHash),
}

/// Set of identity hashes allowed to open sessions
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    identities: HashSet<IdentityHash>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse allow-list entries; any invalid entry fails the whole list
    pub fn from_entries(entries: &[impl AsRef<str>]) -> Result<Self, ConfigError> {
        let mut list = Self::new();
        for entry in entries {
            list.add(entry.as_ref().parse()?);
        }
        Ok(list)
    }

    pub fn add(&mut self, identity: IdentityHash) {
        self.identities.insert(identity);
    }

    pub fn is_allowed(&self, identity: &IdentityHash) -> bool {
        self.identities.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Admission policy of a listener
#[derive(Debug, Clone)]
pub enum Authenticator {
    /// Authentication disabled; anonymous peers are admitted too
    AllowAll,
    /// Only identified peers on the list are admitted
    AllowList(AllowList),
}

impl Authenticator {
    /// Build the policy from listener configuration
    pub fn from_config(config: &ListenerConfig) -> Result<Self, ConfigError> {
        if config.no_auth {
            tracing::warn!("Authentication disabled, any peer may open a session");
            return Ok(Authenticator::AllowAll);
        }

        let list = AllowList::from_entries(&config.allowed)?;
        if list.is_empty() {
            tracing::warn!("Allow-list is empty, no connections will be accepted");
        } else {
            tracing::info!("Allowing {} identities", list.len());
        }
        Ok(Authenticator::AllowList(list))
    }

    /// Decide whether a peer with the given proven identity may proceed
    pub fn authenticate(&self, peer: Option<IdentityHash>) -> Result<(), AuthError> {
        match self {
            Authenticator::AllowAll => Ok(()),
            Authenticator::AllowList(list) => {
                let identity = peer.ok_or(AuthError::NotIdentified)?;
                if list.is_allowed(&identity) {
                    Ok(())
                } else {
                    Err(AuthError::NotAllowed(identity))
                }
            }
        }
    }
}
