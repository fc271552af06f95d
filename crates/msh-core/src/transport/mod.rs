//! Transport abstraction
//!
//! A transport delivers whole messages of at most `mtu` bytes over a link
//! between two identities. Delivery and ordering are best effort; the
//! session layer above numbers and reorders frames itself.

mod memory;
pub mod tcp;

pub use memory::{Impairments, MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use bytes::Bytes;
use msh_protocol::LinkId;
use std::sync::Arc;

use crate::error::TransportError;
use crate::identity::Identity;
use crate::types::{DestinationHash, IdentityHash};

/// An established link to a peer
#[async_trait]
pub trait Link: Send + Sync {
    /// Link identifier, shared by both ends
    fn id(&self) -> LinkId;

    /// Maximum message size in bytes
    fn mtu(&self) -> usize;

    /// Proven identity of the remote end, if it identified
    fn remote_identity(&self) -> Option<IdentityHash>;

    /// Send one message
    async fn send(&self, message: Bytes) -> Result<(), TransportError>;

    /// Receive the next message; `None` once the link is closed
    async fn recv(&self) -> Option<Bytes>;

    /// Close the link; idempotent
    async fn close(&self);

    /// Whether the link has been closed by either side
    fn is_closed(&self) -> bool;
}

/// A transport endpoint
///
/// Listener-side endpoints are bound to a destination and accept links;
/// any endpoint can initiate links to a destination.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Destination this endpoint serves, if bound
    fn destination(&self) -> Option<DestinationHash>;

    /// Make the bound destination discoverable
    async fn announce(&self) -> Result<(), TransportError>;

    /// Wait for the next inbound link
    async fn accept(&self) -> Result<Arc<dyn Link>, TransportError>;

    /// Establish a link to a destination, proving `identify` to the listener
    async fn connect(
        &self,
        destination: DestinationHash,
        identify: Option<&Identity>,
    ) -> Result<Arc<dyn Link>, TransportError>;
}

/// Allocate a fresh random link ID
pub(crate) fn random_link_id() -> LinkId {
    LinkId::new(rand::random())
}
