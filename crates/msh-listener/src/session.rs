//! Listener side of a session
//!
//! Drives one link through `Authenticating → Authenticated → Running →
//! Closed`: admits or refuses the peer, waits for its session request,
//! runs the program on a PTY and relays between the two until the program
//! exits or the link goes away.

use std::sync::Arc;

use bytes::Bytes;
use msh_core::session::{CloseReason, Incoming, LinkDriver, Outgoing, SessionEvent, SessionIo};
use msh_core::transport::Link;
use msh_core::types::ListenerState;
use msh_core::IdentityHash;
use msh_protocol::{
    Control, Frame, FrameCodec, OpenRequest, RemoteStatus, SessionId, StreamKind, PROTOCOL_VERSION,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pty::{ProcessHandle, ProcessIo, ProcessSpec};
use crate::state::ListenerContext;

/// Environment variable holding the peer's identity hash in the child
pub const REMOTE_IDENTITY_ENV: &str = "MESHSH_REMOTE_IDENTITY";

/// How a listener session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The peer was not admitted
    Refused(String),
    /// The peer sent no session request in time
    RequestTimeout,
    /// The program ended, or could not be started, with this status
    Exited(RemoteStatus),
    /// The peer disconnected while the program was running
    Disconnected,
    /// The link failed before the program ended
    LinkLost(CloseReason),
    /// The listener is shutting down
    Shutdown,
}

/// One peer's session on the listener
pub struct ListenerSession {
    id: SessionId,
    ctx: Arc<ListenerContext>,
    link: Arc<dyn Link>,
    peer: Option<IdentityHash>,
    state: ListenerState,
    cancel: CancellationToken,
}

impl ListenerSession {
    pub fn new(ctx: Arc<ListenerContext>, link: Arc<dyn Link>, cancel: CancellationToken) -> Self {
        Self {
            id: SessionId::for_link(link.id()),
            peer: link.remote_identity(),
            ctx,
            link,
            state: ListenerState::AwaitingLink,
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    fn transition(&mut self, next: ListenerState) {
        debug!("{}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    /// Run the session to completion, releasing the link and any process
    pub async fn run(mut self) -> SessionOutcome {
        self.transition(ListenerState::Authenticating);
        let peer = self
            .peer
            .map(|hash| hash.to_string())
            .unwrap_or_else(|| "<anonymous>".to_string());

        if let Err(e) = self.ctx.auth.authenticate(self.peer) {
            warn!("{}: refusing {}: {}", self.id, peer, e);
            self.refuse(&e.to_string()).await;
            self.transition(ListenerState::Closed);
            return SessionOutcome::Refused(e.to_string());
        }
        info!("{}: admitted {}", self.id, peer);
        self.transition(ListenerState::Authenticated);

        let (mut driver, mut io) = match LinkDriver::spawn(Arc::clone(&self.link), &self.ctx.session) {
            Ok(started) => started,
            Err(e) => {
                warn!("{}: cannot drive link: {}", self.id, e);
                self.link.close().await;
                self.transition(ListenerState::Closed);
                return SessionOutcome::LinkLost(CloseReason::LinkClosed);
            }
        };

        let outcome = self.serve(&mut io).await;
        driver.shutdown().await;
        self.transition(ListenerState::Closed);
        info!("{}: session ended: {:?}", self.id, outcome);
        outcome
    }

    /// Best-effort refusal sent straight on the link, then close it
    async fn refuse(&self, reason: &str) {
        let message = FrameCodec::new(self.link.mtu()).and_then(|codec| {
            let mut refused = Control::Refused {
                reason: reason.to_string(),
            };
            refused.fit_payload(codec.max_payload());
            codec.encode(&Frame::control(&refused, 0)?)
        });
        match message {
            Ok(message) => {
                if let Err(e) = self.link.send(message).await {
                    debug!("{}: refusal not sent: {}", self.id, e);
                }
            }
            Err(e) => debug!("{}: cannot encode refusal: {}", self.id, e),
        }
        self.link.close().await;
    }

    async fn serve(&mut self, io: &mut SessionIo) -> SessionOutcome {
        let request = match self.await_open(io).await {
            Ok(request) => request,
            Err(outcome) => return outcome,
        };

        if request.version != PROTOCOL_VERSION {
            let reason = format!(
                "unsupported protocol version {} (expected {})",
                request.version, PROTOCOL_VERSION
            );
            warn!("{}: {}", self.id, reason);
            let _ = io
                .control_tx
                .send(Control::Refused {
                    reason: reason.clone(),
                })
                .await;
            let _ = io.control_tx.send(Control::Disconnect).await;
            self.linger(io).await;
            return SessionOutcome::Refused(reason);
        }

        let (process, process_io) = match ProcessHandle::start(self.process_spec(&request)) {
            Ok(started) => started,
            Err(e) => {
                warn!("{}: {}", self.id, e);
                let status = e
                    .remote_status()
                    .unwrap_or_else(|| RemoteStatus::SpawnFailed(e.to_string()));
                let diagnostic = Bytes::from(format!("meshsh: {}\r\n", e));
                let _ = io
                    .data_tx
                    .send(Outgoing::Data(StreamKind::Stderr, diagnostic))
                    .await;
                let _ = io.data_tx.send(Outgoing::Exit(status.clone())).await;
                self.linger(io).await;
                return SessionOutcome::Exited(status);
            }
        };

        let _ = io
            .control_tx
            .send(Control::Ready { pid: process.pid() })
            .await;
        self.transition(ListenerState::Running);

        let outcome = self.supervise(io, &process, process_io).await;
        process.terminate().await;
        outcome
    }

    async fn await_open(&self, io: &mut SessionIo) -> Result<OpenRequest, SessionOutcome> {
        let deadline = tokio::time::sleep(self.ctx.config.request_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionOutcome::Shutdown),
                _ = &mut deadline => {
                    warn!(
                        "{}: no session request within {:?}",
                        self.id, self.ctx.config.request_timeout
                    );
                    return Err(SessionOutcome::RequestTimeout);
                }
                event = io.events_rx.recv() => match event {
                    Some(SessionEvent::Control(Control::Open(request))) => {
                        debug!(
                            "{}: open request (term {:?}, size {})",
                            self.id, request.term, request.size
                        );
                        return Ok(request);
                    }
                    Some(SessionEvent::Control(Control::Disconnect)) => {
                        return Err(SessionOutcome::Disconnected)
                    }
                    Some(SessionEvent::Closed(reason)) => return Err(SessionOutcome::LinkLost(reason)),
                    None => return Err(SessionOutcome::LinkLost(CloseReason::LinkClosed)),
                    Some(other) => debug!("{}: ignoring {:?} before open", self.id, other),
                },
            }
        }
    }

    fn process_spec(&self, request: &OpenRequest) -> ProcessSpec {
        let term = request
            .term
            .clone()
            .filter(|term| !term.is_empty())
            .unwrap_or_else(|| self.ctx.config.default_term.clone());
        let remote = self.peer.map(|hash| hash.to_string()).unwrap_or_default();

        ProcessSpec::new(self.ctx.program(), self.ctx.args().to_vec())
            .env("TERM", term)
            .env(REMOTE_IDENTITY_ENV, remote)
            .size(request.size)
            .output_window(self.ctx.session.data_window)
    }

    async fn supervise(
        &self,
        io: &mut SessionIo,
        process: &ProcessHandle,
        process_io: ProcessIo,
    ) -> SessionOutcome {
        let ProcessIo {
            mut output_rx,
            input_tx,
        } = process_io;
        let mut output_open = true;
        let mut input_open = true;
        let mut resize_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionOutcome::Shutdown,

                exit = process.wait() => {
                    return self.finish(io, &mut output_rx, exit.into()).await;
                }

                chunk = output_rx.recv(), if output_open => match chunk {
                    Some(bytes) => {
                        if io.data_tx.send(Outgoing::Data(StreamKind::Stdout, bytes)).await.is_err() {
                            output_open = false;
                        }
                    }
                    None => output_open = false,
                },

                incoming = io.data_rx.recv(), if input_open => match incoming {
                    Some(Incoming::Data(StreamKind::Stdin, bytes)) => {
                        if input_tx.send(bytes).await.is_err() {
                            debug!("{}: terminal input closed", self.id);
                        }
                    }
                    Some(Incoming::Data(stream, _)) => {
                        debug!("{}: ignoring {} data from peer", self.id, stream)
                    }
                    Some(Incoming::Exit(_)) => warn!("{}: ignoring exit status from peer", self.id),
                    None => input_open = false,
                },

                changed = io.resize_rx.changed(), if resize_open => {
                    if changed.is_err() {
                        resize_open = false;
                        continue;
                    }
                    let size = *io.resize_rx.borrow_and_update();
                    if let Some(size) = size {
                        if let Err(e) = process.resize(size) {
                            warn!("{}: {}", self.id, e);
                        }
                    }
                }

                event = io.events_rx.recv() => match event {
                    Some(SessionEvent::Control(Control::Signal(kind))) => {
                        if let Err(e) = process.deliver_signal(kind) {
                            warn!("{}: {}", self.id, e);
                        }
                    }
                    Some(SessionEvent::Control(Control::Open(_))) => {
                        // The first Ready was lost
                        let _ = io.control_tx.send(Control::Ready { pid: process.pid() }).await;
                    }
                    Some(SessionEvent::Control(Control::Disconnect)) => {
                        info!("{}: peer disconnected", self.id);
                        return SessionOutcome::Disconnected;
                    }
                    Some(SessionEvent::Closed(reason)) => return SessionOutcome::LinkLost(reason),
                    None => return SessionOutcome::LinkLost(CloseReason::LinkClosed),
                    Some(other) => debug!("{}: ignoring {:?}", self.id, other),
                },
            }
        }
    }

    /// Flush remaining output, report the exit status and wait for the peer
    async fn finish(
        &self,
        io: &mut SessionIo,
        output_rx: &mut mpsc::Receiver<Bytes>,
        status: RemoteStatus,
    ) -> SessionOutcome {
        let data_tx = io.data_tx.clone();
        let drain = async {
            while let Some(bytes) = output_rx.recv().await {
                if data_tx
                    .send(Outgoing::Data(StreamKind::Stdout, bytes))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.ctx.session.exit_drain_timeout, drain)
            .await
            .is_err()
        {
            debug!("{}: terminal still open after exit, not waiting", self.id);
        }

        info!("{}: program {}", self.id, status);
        if io.data_tx.send(Outgoing::Exit(status.clone())).await.is_err() {
            debug!("{}: link gone before exit status was sent", self.id);
        }
        self.linger(io).await;
        SessionOutcome::Exited(status)
    }

    /// Give the peer a chance to receive the exit status and disconnect
    async fn linger(&self, io: &mut SessionIo) {
        let disconnected = async {
            loop {
                match io.events_rx.recv().await {
                    Some(SessionEvent::Control(Control::Disconnect))
                    | Some(SessionEvent::Closed(_))
                    | None => break,
                    Some(_) => {}
                }
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = tokio::time::timeout(self.ctx.session.linger, disconnected) => {
                if result.is_err() {
                    debug!("{}: peer did not disconnect within {:?}", self.id, self.ctx.session.linger);
                }
            }
        }
    }
}
