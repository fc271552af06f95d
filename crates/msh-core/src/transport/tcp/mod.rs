//! TCP transport
//!
//! Each transport message is one length-delimited record on a TCP stream.
//! Link establishment runs the identity handshake in `handshake`; peers
//! find each other through static routes or UDP discovery. Records are not
//! encrypted, so this transport belongs on a trusted network or overlay.

mod discovery;
mod handshake;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use msh_protocol::LinkId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::handshake::{client_handshake, server_handshake, Established, Wire};
use super::{Link, Transport};
use crate::config::TransportConfig;
use crate::error::{ConfigError, TransportError};
use crate::identity::Identity;
use crate::types::{DestinationHash, IdentityHash};

fn wire(stream: TcpStream) -> Wire {
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(u16::MAX as usize)
        .new_codec();
    Framed::new(stream, codec)
}

struct Bound {
    identity: Identity,
    service: String,
    destination: DestinationHash,
    listener: TcpListener,
    port: u16,
}

/// Transport endpoint over TCP
pub struct TcpTransport {
    config: TransportConfig,
    routes: DashMap<DestinationHash, String>,
    bound: Option<Bound>,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// Create an endpoint that only initiates links
    pub fn client(config: TransportConfig) -> Result<Self, ConfigError> {
        let routes = config.static_routes()?.into_iter().collect();
        Ok(Self {
            config,
            routes,
            bound: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Bind a listener serving `service` under `identity`
    ///
    /// Also starts answering discovery requests for the destination; a
    /// busy discovery port is logged and otherwise ignored.
    pub async fn bind(
        config: TransportConfig,
        identity: Identity,
        service: &str,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.bind_address).await?;
        let port = listener.local_addr()?.port();
        let destination = identity.destination(service);
        info!(
            "Listening for {} on {}",
            destination,
            listener.local_addr()?
        );

        let routes = config
            .static_routes()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?
            .into_iter()
            .collect();
        let cancel = CancellationToken::new();

        match UdpSocket::bind(("0.0.0.0", config.discovery_port)).await {
            Ok(socket) => {
                tokio::spawn(discovery::run_responder(
                    socket,
                    destination,
                    port,
                    cancel.clone(),
                ));
            }
            Err(e) => warn!(
                "Discovery disabled, cannot bind UDP port {}: {}",
                config.discovery_port, e
            ),
        }

        Ok(Self {
            config,
            routes,
            bound: Some(Bound {
                identity,
                service: service.to_string(),
                destination,
                listener,
                port,
            }),
            cancel,
        })
    }

    /// Local address of the bound listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
            .as_ref()
            .and_then(|b| b.listener.local_addr().ok())
    }

    /// Add a static route
    pub fn add_route(&self, destination: DestinationHash, address: impl Into<String>) {
        self.routes.insert(destination, address.into());
    }

    async fn resolve(&self, destination: DestinationHash) -> Result<String, TransportError> {
        if let Some(address) = self.routes.get(&destination) {
            return Ok(address.clone());
        }

        debug!("Requesting path to {}", destination);
        let address = discovery::request_path(
            &self.config.broadcast_address,
            self.config.discovery_port,
            destination,
            self.config.path_timeout,
        )
        .await?;
        let address = address.to_string();
        self.routes.insert(destination, address.clone());
        Ok(address)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn destination(&self) -> Option<DestinationHash> {
        self.bound.as_ref().map(|b| b.destination)
    }

    async fn announce(&self) -> Result<(), TransportError> {
        let bound = self.bound.as_ref().ok_or(TransportError::NotListening)?;
        discovery::broadcast_announce(
            &self.config.broadcast_address,
            self.config.discovery_port,
            bound.destination,
            bound.port,
        )
        .await
    }

    async fn accept(&self) -> Result<Arc<dyn Link>, TransportError> {
        let bound = self.bound.as_ref().ok_or(TransportError::NotListening)?;

        loop {
            let (stream, peer) = bound.listener.accept().await?;
            let mut wire = wire(stream);

            let result = tokio::time::timeout(
                self.config.handshake_timeout,
                server_handshake(&mut wire, &bound.identity, &bound.service, self.config.mtu),
            )
            .await;

            match result {
                Ok(Ok(established)) => {
                    debug!(
                        "Link {} established from {}",
                        established.link_id.short(),
                        peer
                    );
                    return Ok(Arc::new(TcpLink::new(wire, established)));
                }
                Ok(Err(e)) => warn!("Handshake with {} failed: {}", peer, e),
                Err(_) => warn!("Handshake with {} timed out", peer),
            }
        }
    }

    async fn connect(
        &self,
        destination: DestinationHash,
        identify: Option<&Identity>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let address = self.resolve(destination).await?;
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        let mut wire = wire(stream);

        let established = tokio::time::timeout(
            self.config.handshake_timeout,
            client_handshake(&mut wire, destination, identify, self.config.mtu),
        )
        .await
        .map_err(|_| TransportError::Handshake("timed out".into()))??;

        debug!(
            "Link {} established to {} at {}",
            established.link_id.short(),
            destination,
            address
        );
        Ok(Arc::new(TcpLink::new(wire, established)))
    }
}

/// A link carried on a TCP stream
pub struct TcpLink {
    id: LinkId,
    mtu: usize,
    remote_identity: Option<IdentityHash>,
    sink: Mutex<SplitSink<Wire, Bytes>>,
    stream: Mutex<SplitStream<Wire>>,
    closed: CancellationToken,
}

impl TcpLink {
    fn new(wire: Wire, established: Established) -> Self {
        let (sink, stream) = wire.split();
        Self {
            id: established.link_id,
            mtu: established.mtu,
            remote_identity: established.remote_identity,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn remote_identity(&self) -> Option<IdentityHash> {
        self.remote_identity
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if message.len() > self.mtu {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                mtu: self.mtu,
            });
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(message).await {
            debug!("Link {} send failed: {}", self.id.short(), e);
            self.closed.cancel();
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Bytes> {
        let mut stream = self.stream.lock().await;
        let next = tokio::select! {
            _ = self.closed.cancelled() => return None,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(record)) => Some(record.freeze()),
            Some(Err(e)) => {
                debug!("Link {} receive failed: {}", self.id.short(), e);
                self.closed.cancel();
                None
            }
            None => {
                self.closed.cancel();
                None
            }
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
