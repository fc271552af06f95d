//! Link establishment handshake
//!
//! ```text
//! client -> Hello    { destination, nonce, mtu }
//! server -> Welcome  { public_key, service, signature(nonce || link_id), link_id, mtu }
//! client -> Identify { public_key, signature(link_id || server key) } | Anonymous
//! ```
//!
//! The client checks that the server's key and service name hash to the
//! requested destination. The server learns a proven identity hash, or
//! none when the client stays anonymous.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::TransportError;
use crate::identity::{verify_signature, Identity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::types::{DestinationHash, IdentityHash};
use msh_protocol::LinkId;

const WELCOME_CONTEXT: &[u8] = b"meshsh-welcome";
const IDENTIFY_CONTEXT: &[u8] = b"meshsh-identify";

pub(crate) type Wire = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    Hello {
        destination: DestinationHash,
        nonce: [u8; 32],
        mtu: u32,
    },
    Welcome {
        public_key: [u8; PUBLIC_KEY_LENGTH],
        service: String,
        signature: Vec<u8>,
        link_id: [u8; 16],
        mtu: u32,
    },
    Identify {
        public_key: [u8; PUBLIC_KEY_LENGTH],
        signature: Vec<u8>,
    },
    Anonymous,
    Reject {
        reason: String,
    },
}

/// Result of a completed handshake
#[derive(Debug, Clone, Copy)]
pub(crate) struct Established {
    pub link_id: LinkId,
    pub mtu: usize,
    pub remote_identity: Option<IdentityHash>,
}

fn handshake_error(reason: impl Into<String>) -> TransportError {
    TransportError::Handshake(reason.into())
}

async fn write(wire: &mut Wire, message: &Handshake) -> Result<(), TransportError> {
    let bytes = bincode::serialize(message).map_err(|e| handshake_error(e.to_string()))?;
    wire.send(Bytes::from(bytes)).await?;
    Ok(())
}

async fn read(wire: &mut Wire) -> Result<Handshake, TransportError> {
    let record = wire
        .next()
        .await
        .ok_or_else(|| handshake_error("connection closed during handshake"))??;
    bincode::deserialize(&record).map_err(|e| handshake_error(e.to_string()))
}

fn signature_bytes(signature: &[u8]) -> Result<[u8; SIGNATURE_LENGTH], TransportError> {
    signature
        .try_into()
        .map_err(|_| handshake_error("signature has wrong length"))
}

fn welcome_message(nonce: &[u8; 32], link_id: &[u8; 16]) -> Vec<u8> {
    [WELCOME_CONTEXT, nonce.as_slice(), link_id.as_slice()].concat()
}

fn identify_message(link_id: &[u8; 16], server_key: &[u8; PUBLIC_KEY_LENGTH]) -> Vec<u8> {
    [IDENTIFY_CONTEXT, link_id.as_slice(), server_key.as_slice()].concat()
}

/// Run the initiating side of the handshake
pub(crate) async fn client_handshake(
    wire: &mut Wire,
    destination: DestinationHash,
    identify: Option<&Identity>,
    mtu: usize,
) -> Result<Established, TransportError> {
    let nonce: [u8; 32] = rand::random();
    write(
        wire,
        &Handshake::Hello {
            destination,
            nonce,
            mtu: mtu as u32,
        },
    )
    .await?;

    let (public_key, service, signature, link_id, server_mtu) = match read(wire).await? {
        Handshake::Welcome {
            public_key,
            service,
            signature,
            link_id,
            mtu,
        } => (public_key, service, signature, link_id, mtu),
        Handshake::Reject { reason } => return Err(handshake_error(reason)),
        other => return Err(handshake_error(format!("unexpected {:?}", other))),
    };

    let server_identity = IdentityHash::from_public_key(&public_key);
    if DestinationHash::derive(&service, &server_identity) != destination {
        return Err(TransportError::IdentityMismatch {
            destination,
            presented: server_identity,
        });
    }
    let signature = signature_bytes(&signature)?;
    if !verify_signature(&public_key, &welcome_message(&nonce, &link_id), &signature) {
        return Err(handshake_error("listener failed to prove its identity"));
    }

    let reply = match identify {
        Some(identity) => Handshake::Identify {
            public_key: identity.public_key(),
            signature: identity
                .sign(&identify_message(&link_id, &public_key))
                .to_vec(),
        },
        None => Handshake::Anonymous,
    };
    write(wire, &reply).await?;

    Ok(Established {
        link_id: LinkId::new(link_id),
        mtu: (server_mtu as usize).min(mtu),
        remote_identity: Some(server_identity),
    })
}

/// Run the accepting side of the handshake
pub(crate) async fn server_handshake(
    wire: &mut Wire,
    identity: &Identity,
    service: &str,
    mtu: usize,
) -> Result<Established, TransportError> {
    let destination = identity.destination(service);

    let (requested, nonce, client_mtu) = match read(wire).await? {
        Handshake::Hello {
            destination,
            nonce,
            mtu,
        } => (destination, nonce, mtu),
        other => return Err(handshake_error(format!("unexpected {:?}", other))),
    };

    if requested != destination {
        let _ = write(
            wire,
            &Handshake::Reject {
                reason: format!("destination {} is not served here", requested),
            },
        )
        .await;
        return Err(TransportError::UnknownDestination(requested));
    }

    let link_id: [u8; 16] = rand::random();
    let mtu = (client_mtu as usize).min(mtu);
    write(
        wire,
        &Handshake::Welcome {
            public_key: identity.public_key(),
            service: service.to_string(),
            signature: identity.sign(&welcome_message(&nonce, &link_id)).to_vec(),
            link_id,
            mtu: mtu as u32,
        },
    )
    .await?;

    let remote_identity = match read(wire).await? {
        Handshake::Identify {
            public_key,
            signature,
        } => {
            let signature = signature_bytes(&signature)?;
            let message = identify_message(&link_id, &identity.public_key());
            if !verify_signature(&public_key, &message, &signature) {
                return Err(handshake_error("peer failed to prove its identity"));
            }
            Some(IdentityHash::from_public_key(&public_key))
        }
        Handshake::Anonymous => None,
        other => return Err(handshake_error(format!("unexpected {:?}", other))),
    };

    Ok(Established {
        link_id: LinkId::new(link_id),
        mtu,
        remote_identity,
    })
}
