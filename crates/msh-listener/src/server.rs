//! Listener server
//!
//! Accepts links on a bound transport and runs one session task per link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use msh_core::error::TransportError;
use msh_core::transport::{Link, Transport};
use msh_core::{DestinationHash, IdentityHash};
use msh_protocol::SessionId;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{ListenerSession, SessionOutcome};
use crate::state::ListenerContext;

/// Shortest allowed spacing between announces
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A live session, as seen by the server
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: Option<IdentityHash>,
    pub started: Instant,
}

/// Serves sessions for one destination
pub struct ListenerServer {
    transport: Arc<dyn Transport>,
    ctx: Arc<ListenerContext>,
    sessions: Arc<DashMap<SessionId, SessionInfo>>,
    outcomes: Option<mpsc::UnboundedSender<(SessionId, SessionOutcome)>>,
    cancel: CancellationToken,
}

impl ListenerServer {
    pub fn new(
        transport: Arc<dyn Transport>,
        ctx: Arc<ListenerContext>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            ctx,
            sessions: Arc::new(DashMap::new()),
            outcomes: None,
            cancel,
        }
    }

    /// Report how each session ended
    pub fn with_outcomes(mut self, outcomes: mpsc::UnboundedSender<(SessionId, SessionOutcome)>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    pub fn destination(&self) -> Option<DestinationHash> {
        self.transport.destination()
    }

    /// Number of sessions currently running
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }


    /// Accept links until cancelled, then close every session
    pub async fn run(&self) -> Result<(), TransportError> {
        let destination = self
            .transport
            .destination()
            .ok_or(TransportError::NotListening)?;
        info!(
            "Serving {} {:?} on {}",
            self.ctx.program(),
            self.ctx.args(),
            destination
        );

        let announce_every = self.ctx.config.announce_interval.max(MIN_ANNOUNCE_INTERVAL);
        let mut announce = tokio::time::interval(announce_every);
        let session_cancel = self.cancel.child_token();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Listener shutting down");
                    break;
                }

                _ = announce.tick(), if self.ctx.config.announce => {
                    match self.transport.announce().await {
                        Ok(()) => debug!("Announced {}", destination),
                        Err(e) => warn!("Failed to announce {}: {}", destination, e),
                    }
                }

                accepted = self.transport.accept() => match accepted {
                    Ok(link) => self.spawn_session(&mut tasks, link, &session_cancel),
                    Err(TransportError::Shutdown) => {
                        info!("Transport shut down");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to accept link: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },

                Some(finished) = tasks.join_next() => {
                    if let Err(e) = finished {
                        warn!("Session task failed: {}", e);
                    }
                }
            }
        }

        session_cancel.cancel();
        if self.active_sessions() > 0 {
            info!("Closing {} sessions", self.active_sessions());
        }
        for entry in self.sessions.iter() {
            let peer = entry
                .peer
                .map(|hash| hash.to_string())
                .unwrap_or_else(|| "<anonymous>".to_string());
            debug!("{}: closing session of {} after {:?}", entry.key(), peer, entry.started.elapsed());
        }
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                warn!("Session task failed: {}", e);
            }
        }
        Ok(())
    }

    fn spawn_session(&self, tasks: &mut JoinSet<()>, link: Arc<dyn Link>, cancel: &CancellationToken) {
        let session = ListenerSession::new(Arc::clone(&self.ctx), Arc::clone(&link), cancel.child_token());
        let id = session.id();
        debug!("{}: link accepted", id);

        self.sessions.insert(
            id,
            SessionInfo {
                peer: link.remote_identity(),
                started: Instant::now(),
            },
        );

        let sessions = Arc::clone(&self.sessions);
        let outcomes = self.outcomes.clone();
        tasks.spawn(async move {
            let outcome = session.run().await;
            sessions.remove(&id);
            if let Some(outcomes) = outcomes {
                let _ = outcomes.send((id, outcome));
            }
        });
    }
}
