//! msh-core: Shared building blocks for meshsh
//!
//! This crate provides identities and destination hashing, configuration,
//! the transport abstraction with its in-memory and TCP implementations,
//! and the session multiplexer that both the listener and the client
//! drive over a link.

pub mod config;
pub mod error;
pub mod identity;
pub mod session;
pub mod transport;
pub mod types;

pub use error::MshError;
pub use identity::Identity;
pub use types::{DestinationHash, IdentityHash};
