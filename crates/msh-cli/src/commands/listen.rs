//! `meshsh listen`

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use msh_core::config::ConfigFile;
use msh_core::transport::TcpTransport;
use msh_listener::{ListenerContext, ListenerServer};
use tokio_util::sync::CancellationToken;

use super::load_identity;
use crate::output::{print_field, print_warning};

/// Command line overrides for the listener
#[derive(Debug, Default)]
pub struct ListenOptions {
    pub service: Option<String>,
    pub allowed: Vec<String>,
    pub no_auth: bool,
    pub no_announce: bool,
    pub bind: Option<String>,
    pub program: Vec<String>,
}

impl ListenOptions {
    /// Fold the overrides into a loaded configuration
    pub fn apply(self, config: &mut ConfigFile) {
        let listener = &mut config.listener;
        if let Some(service) = self.service {
            listener.service_name = service;
        }
        listener.allowed.extend(self.allowed);
        listener.no_auth |= self.no_auth;
        if self.no_announce {
            listener.announce = false;
        }
        if !self.program.is_empty() {
            listener.program = self.program;
        }
        if let Some(bind) = self.bind {
            config.transport.bind_address = bind;
        }
    }
}

/// Serve the configured program until interrupted
pub async fn listen_command(
    mut config: ConfigFile,
    identity_path: &Path,
    options: ListenOptions,
) -> Result<()> {
    options.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let identity = load_identity(identity_path)?;
    let service = config.listener.service_name.clone();
    let ctx = ListenerContext::new(config.listener.clone(), config.session.clone())
        .context("Invalid listener configuration")?;

    if config.listener.no_auth {
        print_warning(&format!(
            "Authentication disabled, any peer may run {}",
            ctx.program()
        ));
    }

    let bind_address = config.transport.bind_address.clone();
    let transport = TcpTransport::bind(config.transport, identity.clone(), &service)
        .await
        .with_context(|| format!("Failed to listen on {}", bind_address))?;
    if let Some(address) = transport.local_addr() {
        tracing::info!("Accepting links on {}", address);
    }

    print_field("Identity", &identity.hash().to_string());
    print_field("Listening on", &identity.destination(&service).to_string());

    let cancel = CancellationToken::new();
    let server = ListenerServer::new(Arc::new(transport), Arc::new(ctx), cancel.clone());

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Cannot watch for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        cancel_clone.cancel();
    });

    server.run().await.context("Listener failed")?;
    tracing::info!("Listener stopped");
    Ok(())
}
