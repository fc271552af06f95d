//! In-process transport
//!
//! `MemoryNetwork` connects transports living in the same process. Links
//! can be impaired to exercise the session layer: messages may be dropped,
//! duplicated or delayed past their successors, and the whole network can
//! be black-holed so links go silent without either side seeing a close.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use msh_protocol::LinkId;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{random_link_id, Link, Transport};
use crate::error::TransportError;
use crate::identity::Identity;
use crate::types::{DestinationHash, IdentityHash};

/// Messages queued per link direction
const LINK_QUEUE: usize = 256;

/// Deterministic message impairments, counted per link end
#[derive(Debug, Clone, Default)]
pub struct Impairments {
    /// Drop every Nth message
    pub drop_every: Option<u32>,
    /// Deliver every Nth message twice
    pub duplicate_every: Option<u32>,
    /// Hold back every Nth message by `delay`, letting later ones overtake it
    pub delay_every: Option<u32>,
    pub delay: Duration,
}

fn hits(every: Option<u32>, n: u32) -> bool {
    matches!(every, Some(k) if k > 0 && n % k == 0)
}

struct NetworkInner {
    mtu: usize,
    listeners: DashMap<DestinationHash, (IdentityHash, mpsc::Sender<Arc<MemoryLink>>)>,
    announces: DashMap<DestinationHash, usize>,
    impairments: Mutex<Impairments>,
    blackhole: AtomicBool,
}

/// A set of in-process transports that can reach each other
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create a network whose links carry messages of up to `mtu` bytes
    pub fn new(mtu: usize) -> Self {
        Self::with_impairments(mtu, Impairments::default())
    }

    /// Create a network with impaired links
    pub fn with_impairments(mtu: usize, impairments: Impairments) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                mtu,
                listeners: DashMap::new(),
                announces: DashMap::new(),
                impairments: Mutex::new(impairments),
                blackhole: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the impairments applied to subsequent messages
    pub fn set_impairments(&self, impairments: Impairments) {
        if let Ok(mut current) = self.inner.impairments.lock() {
            *current = impairments;
        }
    }

    /// Silently discard every message, including close notices
    pub fn set_blackhole(&self, enabled: bool) {
        self.inner.blackhole.store(enabled, Ordering::SeqCst);
    }

    /// Number of announces seen for a destination
    pub fn announce_count(&self, destination: &DestinationHash) -> usize {
        self.inner
            .announces
            .get(destination)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Bind a transport serving `service` under `identity`
    pub fn bind(&self, identity: &Identity, service: &str) -> MemoryTransport {
        let destination = identity.destination(service);
        let (tx, rx) = mpsc::channel(16);
        self.inner
            .listeners
            .insert(destination, (identity.hash(), tx));

        MemoryTransport {
            network: self.clone(),
            bound: Some(Bound {
                destination,
                incoming: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Create an unbound transport that can only initiate links
    pub fn endpoint(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            bound: None,
        }
    }
}

struct Bound {
    destination: DestinationHash,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Arc<MemoryLink>>>,
}

/// Transport endpoint on a `MemoryNetwork`
pub struct MemoryTransport {
    network: MemoryNetwork,
    bound: Option<Bound>,
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(bound) = &self.bound {
            self.network.inner.listeners.remove(&bound.destination);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn destination(&self) -> Option<DestinationHash> {
        self.bound.as_ref().map(|b| b.destination)
    }

    async fn announce(&self) -> Result<(), TransportError> {
        let bound = self.bound.as_ref().ok_or(TransportError::NotListening)?;
        *self
            .network
            .inner
            .announces
            .entry(bound.destination)
            .or_insert(0) += 1;
        debug!("Announced {}", bound.destination);
        Ok(())
    }

    async fn accept(&self) -> Result<Arc<dyn Link>, TransportError> {
        let bound = self.bound.as_ref().ok_or(TransportError::NotListening)?;
        let mut incoming = bound.incoming.lock().await;
        match incoming.recv().await {
            Some(link) => Ok(link),
            None => Err(TransportError::Shutdown),
        }
    }

    async fn connect(
        &self,
        destination: DestinationHash,
        identify: Option<&Identity>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let (listener_identity, listener_tx) = self
            .network
            .inner
            .listeners
            .get(&destination)
            .map(|entry| (entry.0, entry.1.clone()))
            .ok_or(TransportError::UnknownDestination(destination))?;

        let id = random_link_id();
        let shared_closed = CancellationToken::new();
        let (to_listener, from_client) = mpsc::channel(LINK_QUEUE);
        let (to_client, from_listener) = mpsc::channel(LINK_QUEUE);

        let client_end = Arc::new(MemoryLink::new(
            id,
            Some(listener_identity),
            to_listener,
            from_listener,
            shared_closed.clone(),
            Arc::clone(&self.network.inner),
        ));
        let listener_end = Arc::new(MemoryLink::new(
            id,
            identify.map(|identity| identity.hash()),
            to_client,
            from_client,
            shared_closed,
            Arc::clone(&self.network.inner),
        ));

        listener_tx
            .send(listener_end)
            .await
            .map_err(|_| TransportError::UnknownDestination(destination))?;

        debug!("Memory link {} established to {}", id.short(), destination);
        Ok(client_end)
    }
}

/// One end of an in-process link
pub struct MemoryLink {
    id: LinkId,
    remote_identity: Option<IdentityHash>,
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    local_closed: CancellationToken,
    shared_closed: CancellationToken,
    network: Arc<NetworkInner>,
    sent: AtomicU32,
}

impl MemoryLink {
    fn new(
        id: LinkId,
        remote_identity: Option<IdentityHash>,
        tx: mpsc::Sender<Bytes>,
        rx: mpsc::Receiver<Bytes>,
        shared_closed: CancellationToken,
        network: Arc<NetworkInner>,
    ) -> Self {
        Self {
            id,
            remote_identity,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            local_closed: CancellationToken::new(),
            shared_closed,
            network,
            sent: AtomicU32::new(0),
        }
    }

    fn impairments(&self) -> Impairments {
        self.network
            .impairments
            .lock()
            .map(|imp| imp.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn mtu(&self) -> usize {
        self.network.mtu
    }

    fn remote_identity(&self) -> Option<IdentityHash> {
        self.remote_identity
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if message.len() > self.network.mtu {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                mtu: self.network.mtu,
            });
        }
        if self.network.blackhole.load(Ordering::SeqCst) {
            trace!("Link {} black-holed a message", self.id.short());
            return Ok(());
        }

        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let impairments = self.impairments();

        if hits(impairments.drop_every, n) {
            trace!("Link {} dropped message {}", self.id.short(), n);
            return Ok(());
        }

        if hits(impairments.delay_every, n) {
            let tx = self.tx.clone();
            let delay = impairments.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(message).await;
            });
            return Ok(());
        }

        if hits(impairments.duplicate_every, n) {
            self.tx
                .send(message.clone())
                .await
                .map_err(|_| TransportError::Closed)?;
        }

        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        if self.local_closed.is_cancelled() {
            return None;
        }
        // Messages sent before the peer closed are still delivered
        if let Ok(message) = rx.try_recv() {
            return Some(message);
        }

        tokio::select! {
            biased;
            _ = self.local_closed.cancelled() => None,
            message = rx.recv() => match message {
                Some(message) => Some(message),
                // A dropped peer end is just more silence on a black-holed network
                None if self.network.blackhole.load(Ordering::SeqCst) => {
                    self.local_closed.cancelled().await;
                    None
                }
                None => None,
            },
            _ = self.shared_closed.cancelled() => rx.try_recv().ok(),
        }
    }

    async fn close(&self) {
        self.local_closed.cancel();
        if !self.network.blackhole.load(Ordering::SeqCst) {
            self.shared_closed.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.local_closed.is_cancelled() || self.shared_closed.is_cancelled()
    }
}
