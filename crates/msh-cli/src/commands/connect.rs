//! `meshsh connect`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use msh_client::{exit, ClientSession, LocalTerminal};
use msh_core::config::ConfigFile;
use msh_core::transport::TcpTransport;
use msh_core::DestinationHash;

use super::load_identity;
use crate::output::print_error;

/// Command line overrides for the client
#[derive(Debug, Default)]
pub struct ConnectOptions {
    pub destination: String,
    pub mirror: bool,
    pub no_id: bool,
    /// Connect and request timeout in seconds
    pub timeout: Option<u64>,
    /// Address of the listener, bypassing discovery
    pub via: Option<String>,
}

impl ConnectOptions {
    /// Fold the overrides into a loaded configuration
    pub fn apply(&self, config: &mut ConfigFile) {
        let client = &mut config.client;
        client.mirror |= self.mirror;
        client.no_identify |= self.no_id;
        if let Some(secs) = self.timeout {
            client.connect_timeout = Duration::from_secs(secs);
            client.request_timeout = Duration::from_secs(secs);
        }
    }
}

/// Run a session with a listener; returns the process exit code
pub async fn connect_command(
    mut config: ConfigFile,
    identity_path: &Path,
    options: ConnectOptions,
) -> Result<u8> {
    options.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let destination: DestinationHash = options
        .destination
        .parse()
        .with_context(|| format!("Invalid destination {:?}", options.destination))?;

    let identity = if config.client.no_identify {
        None
    } else {
        Some(load_identity(identity_path)?)
    };

    let transport = TcpTransport::client(config.transport.clone())
        .context("Invalid transport configuration")?;
    if let Some(via) = &options.via {
        transport.add_route(destination, via.clone());
    }

    let mirror = config.client.mirror;
    let session = ClientSession::new(
        Arc::new(transport),
        destination,
        identity,
        config.client,
        config.session,
    );

    match LocalTerminal::detect().attach(session).await {
        Ok(end) => {
            tracing::debug!("Session ended: {:?}", end);
            Ok(exit::for_session(&end, mirror))
        }
        Err(e) => {
            print_error(&e.to_string());
            Ok(exit::for_error(&e))
        }
    }
}
