//! Client error types

use msh_core::error::{ConnectionError, TransportError};
use msh_core::MshError;
use thiserror::Error;

/// Errors ending a client session before the remote program reported an exit
#[derive(Error, Debug)]
pub enum ClientError {
    /// Session establishment or the link failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The transport could not reach the destination
    #[error("Could not establish link: {0}")]
    Link(#[from] TransportError),

    /// The session could not be driven over the link
    #[error("Session setup failed: {0}")]
    Session(#[from] MshError),

    /// The local terminal could not be set up or written
    #[error("Terminal error: {0}")]
    Terminal(#[from] std::io::Error),
}
