//! Destination discovery over UDP broadcast
//!
//! Listeners broadcast an `Announce` when they start and answer
//! `PathRequest`s for their destination with a unicast `Announce`. An
//! announce only says where to connect; the link handshake proves who is
//! listening there.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::types::DestinationHash;

const MAX_PACKET: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum DiscoveryPacket {
    PathRequest { destination: DestinationHash },
    Announce { destination: DestinationHash, port: u16 },
}

fn encode(packet: &DiscoveryPacket) -> Result<Vec<u8>, TransportError> {
    bincode::serialize(packet).map_err(|e| TransportError::Handshake(e.to_string()))
}

/// Broadcast an announce for a destination reachable on `port`
pub(crate) async fn broadcast_announce(
    broadcast: &str,
    discovery_port: u16,
    destination: DestinationHash,
    port: u16,
) -> Result<(), TransportError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let packet = encode(&DiscoveryPacket::Announce { destination, port })?;
    socket
        .send_to(&packet, (broadcast, discovery_port))
        .await?;
    debug!("Broadcast announce for {} on port {}", destination, port);
    Ok(())
}

/// Answer path requests for `destination` until cancelled
pub(crate) async fn run_responder(
    socket: UdpSocket,
    destination: DestinationHash,
    port: u16,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_PACKET];
    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!("Discovery socket error: {}", e);
                    continue;
                }
            },
        };

        let Ok(DiscoveryPacket::PathRequest { destination: wanted }) =
            bincode::deserialize::<DiscoveryPacket>(&buf[..len])
        else {
            trace!("Ignoring discovery packet from {}", from);
            continue;
        };
        if wanted != destination {
            continue;
        }

        match encode(&DiscoveryPacket::Announce { destination, port }) {
            Ok(reply) => {
                if let Err(e) = socket.send_to(&reply, from).await {
                    warn!("Failed to answer path request from {}: {}", from, e);
                } else {
                    debug!("Answered path request from {}", from);
                }
            }
            Err(e) => warn!("Failed to encode announce: {}", e),
        }
    }
}

/// Ask the network where `destination` is reachable
pub(crate) async fn request_path(
    broadcast: &str,
    discovery_port: u16,
    destination: DestinationHash,
    timeout: Duration,
) -> Result<SocketAddr, TransportError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let request = encode(&DiscoveryPacket::PathRequest { destination })?;
    socket
        .send_to(&request, (broadcast, discovery_port))
        .await?;

    let wait = async {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if let Ok(DiscoveryPacket::Announce {
                destination: found,
                port,
            }) = bincode::deserialize::<DiscoveryPacket>(&buf[..len])
            {
                if found == destination {
                    return Ok::<_, TransportError>(SocketAddr::new(from.ip(), port));
                }
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::UnknownDestination(destination)),
    }
}
