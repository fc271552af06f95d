//! Client side of a session
//!
//! Drives `Idle → Connecting → Requesting → Active → Closed`: establishes
//! the link, asks the listener to start its program, then relays the
//! local terminal to it until the program exits or the link is lost.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use msh_core::config::{ClientConfig, SessionConfig};
use msh_core::error::ConnectionError;
use msh_core::session::{CloseReason, Incoming, LinkDriver, Outgoing, SessionEvent, SessionIo};
use msh_core::transport::{Link, Transport};
use msh_core::types::ClientState;
use msh_core::{DestinationHash, Identity};
use msh_protocol::{Control, OpenRequest, RemoteStatus, SignalKind, StreamKind, TerminalSize};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::ClientError;
use crate::retry::ExponentialBackoff;

/// Sent to the remote terminal when local input ends (Ctrl-D)
const END_OF_INPUT: u8 = 0x04;
/// How long a queued `Disconnect` may take to leave
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Local requests that are not terminal input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSignal {
    /// Forward a signal to the remote program
    Forward(SignalKind),
    /// Leave the session
    Detach,
}

/// How a client session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The remote program ended, or could not be started
    Exited(RemoteStatus),
    /// Left locally before the program ended
    Detached,
}

/// Session side of the local terminal
pub struct LocalIo {
    /// TERM requested for the remote program
    pub term: Option<String>,
    /// Current local window size
    pub size_rx: watch::Receiver<TerminalSize>,
    /// Raw input; closed at end of input
    pub input_rx: mpsc::Receiver<Bytes>,
    pub signal_rx: mpsc::Receiver<LocalSignal>,
    /// Remote output in arrival order
    pub output_tx: mpsc::Sender<(StreamKind, Bytes)>,
}

/// Terminal side of the local terminal
pub struct LocalEnds {
    pub size_tx: watch::Sender<TerminalSize>,
    pub input_tx: mpsc::Sender<Bytes>,
    pub signal_tx: mpsc::Sender<LocalSignal>,
    pub output_rx: mpsc::Receiver<(StreamKind, Bytes)>,
}

impl LocalIo {
    /// Create connected session and terminal ends
    ///
    /// `window` bounds unread input and unwritten output.
    pub fn pair(term: Option<String>, size: TerminalSize, window: usize) -> (Self, LocalEnds) {
        let (size_tx, size_rx) = watch::channel(size);
        let (input_tx, input_rx) = mpsc::channel(window);
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (output_tx, output_rx) = mpsc::channel(window);
        (
            Self {
                term,
                size_rx,
                input_rx,
                signal_rx,
                output_tx,
            },
            LocalEnds {
                size_tx,
                input_tx,
                signal_tx,
                output_rx,
            },
        )
    }
}

enum Requested {
    Ready(u32),
    Ended(SessionEnd),
}

/// A session with one listener destination
pub struct ClientSession {
    transport: Arc<dyn Transport>,
    destination: DestinationHash,
    identity: Option<Identity>,
    config: ClientConfig,
    session: SessionConfig,
    state_tx: watch::Sender<ClientState>,
}

impl ClientSession {
    /// `identity` is proven to the listener; `None` connects anonymously
    pub fn new(
        transport: Arc<dyn Transport>,
        destination: DestinationHash,
        identity: Option<Identity>,
        config: ClientConfig,
        session: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Idle);
        Self {
            transport,
            destination,
            identity,
            config,
            session,
            state_tx,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: ClientState) {
        debug!("{}: {} -> {}", self.destination, self.state(), next);
        self.state_tx.send_replace(next);
    }

    /// Run the session to its end
    pub async fn run(self, local: LocalIo) -> Result<SessionEnd, ClientError> {
        let LocalIo {
            term,
            size_rx,
            input_rx,
            mut signal_rx,
            output_tx,
        } = local;

        self.transition(ClientState::Connecting);
        let link = match self.connect(&mut signal_rx).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                self.transition(ClientState::Closed);
                return Ok(SessionEnd::Detached);
            }
            Err(e) => {
                self.transition(ClientState::Closed);
                return Err(e);
            }
        };

        let (mut driver, mut io) = match LinkDriver::spawn(Arc::clone(&link), &self.session) {
            Ok(started) => started,
            Err(e) => {
                link.close().await;
                self.transition(ClientState::Closed);
                return Err(e.into());
            }
        };
        info!("{}: link established", driver.session_id());

        let result = self
            .drive(&mut io, term, size_rx, input_rx, signal_rx, output_tx)
            .await;
        driver.shutdown().await;
        self.transition(ClientState::Closed);
        result
    }

    /// Establish the link; `None` if left locally first
    async fn connect(
        &self,
        signal_rx: &mut mpsc::Receiver<LocalSignal>,
    ) -> Result<Option<Arc<dyn Link>>, ClientError> {
        let timeout = self.config.connect_timeout;
        let identify = if self.config.no_identify {
            None
        } else {
            self.identity.as_ref()
        };
        let connecting = tokio::time::timeout(
            timeout,
            self.transport.connect(self.destination, identify),
        );
        tokio::pin!(connecting);

        tokio::select! {
            result = &mut connecting => match result {
                Ok(Ok(link)) => Ok(Some(link)),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ConnectionError::ConnectTimeout(timeout).into()),
            },
            Some(signal) = signal_rx.recv() => {
                info!("{:?} while connecting, giving up", signal);
                Ok(None)
            }
        }
    }

    async fn drive(
        &self,
        io: &mut SessionIo,
        term: Option<String>,
        mut size_rx: watch::Receiver<TerminalSize>,
        input_rx: mpsc::Receiver<Bytes>,
        mut signal_rx: mpsc::Receiver<LocalSignal>,
        output_tx: mpsc::Sender<(StreamKind, Bytes)>,
    ) -> Result<SessionEnd, ClientError> {
        self.transition(ClientState::Requesting);
        let size = *size_rx.borrow_and_update();
        let request = OpenRequest::new(term, size);

        match self.request(io, request, &mut signal_rx, &output_tx).await? {
            Requested::Ready(pid) => info!("Remote program started (pid {})", pid),
            Requested::Ended(end) => {
                disconnect(io).await;
                return Ok(end);
            }
        }

        self.transition(ClientState::Active);
        let input = tokio::spawn(forward_input(input_rx, io.data_tx.clone()));
        let result = relay(io, size_rx, signal_rx, &output_tx).await;
        input.abort();

        if result.is_ok() {
            disconnect(io).await;
        }
        result
    }

    /// Send `Open` until the listener answers
    async fn request(
        &self,
        io: &mut SessionIo,
        request: OpenRequest,
        signal_rx: &mut mpsc::Receiver<LocalSignal>,
        output_tx: &mpsc::Sender<(StreamKind, Bytes)>,
    ) -> Result<Requested, ClientError> {
        let timeout = self.config.request_timeout;
        let deadline = Instant::now() + timeout;
        let mut backoff = ExponentialBackoff::from_config(&self.config.retry);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            trace!("Sending session request (attempt {})", attempt);
            if io.control_tx.send(Control::Open(request.clone())).await.is_err() {
                debug!("Control lane closed, waiting for the driver to stop");
            }
            let retry = sleep(backoff.next_delay());
            tokio::pin!(retry);

            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => {
                        return Err(ConnectionError::RequestTimeout(timeout).into());
                    }

                    _ = &mut retry => break,

                    event = io.events_rx.recv() => match event {
                        Some(SessionEvent::Control(Control::Ready { pid })) => {
                            return Ok(Requested::Ready(pid));
                        }
                        Some(SessionEvent::Control(Control::Refused { reason })) => {
                            warn!("Session refused: {}", reason);
                            return Err(ConnectionError::AuthenticationFailed(reason).into());
                        }
                        Some(SessionEvent::Closed(reason)) => {
                            return closed_while_requesting(io, output_tx, reason).await;
                        }
                        None => {
                            return closed_while_requesting(io, output_tx, CloseReason::Shutdown).await;
                        }
                        Some(other) => trace!("Ignoring {:?} while requesting", other),
                    },

                    Some(incoming) = io.data_rx.recv() => match incoming {
                        Incoming::Data(stream, bytes) => write_output(output_tx, stream, bytes).await,
                        Incoming::Exit(report) => {
                            warn!("Remote program did not start: {}", report.status);
                            return Ok(Requested::Ended(SessionEnd::Exited(report.status)));
                        }
                    },

                    Some(signal) = signal_rx.recv() => {
                        info!("{:?} before the program started, giving up", signal);
                        return Ok(Requested::Ended(SessionEnd::Detached));
                    }
                }
            }
        }
    }
}

/// A link closing before `Ready` means the listener turned the peer away,
/// unless it reported an exit status on the way out
async fn closed_while_requesting(
    io: &mut SessionIo,
    output_tx: &mpsc::Sender<(StreamKind, Bytes)>,
    reason: CloseReason,
) -> Result<Requested, ClientError> {
    if let Some(end) = drain_exit(io, output_tx).await {
        return Ok(Requested::Ended(end));
    }
    Err(ConnectionError::AuthenticationFailed(format!(
        "link closed before the session started ({})",
        reason
    ))
    .into())
}

/// Relay between the running program and the local terminal
async fn relay(
    io: &mut SessionIo,
    mut size_rx: watch::Receiver<TerminalSize>,
    mut signal_rx: mpsc::Receiver<LocalSignal>,
    output_tx: &mpsc::Sender<(StreamKind, Bytes)>,
) -> Result<SessionEnd, ClientError> {
    let mut sizes_open = true;
    let mut signals_open = true;
    let mut data_open = true;

    // The size in the request may already be stale
    io.resize_tx.send_replace(Some(*size_rx.borrow_and_update()));

    loop {
        tokio::select! {
            incoming = io.data_rx.recv(), if data_open => match incoming {
                Some(Incoming::Data(stream, bytes)) => write_output(output_tx, stream, bytes).await,
                Some(Incoming::Exit(report)) => {
                    info!("Remote program {}", report.status);
                    return Ok(SessionEnd::Exited(report.status));
                }
                None => data_open = false,
            },

            event = io.events_rx.recv() => match event {
                Some(SessionEvent::Closed(reason)) => {
                    if let Some(end) = drain_exit(io, output_tx).await {
                        return Ok(end);
                    }
                    return Err(ConnectionError::LinkLost(reason.to_string()).into());
                }
                None => {
                    return Err(ConnectionError::LinkLost(CloseReason::Shutdown.to_string()).into());
                }
                Some(SessionEvent::Degraded(notice)) => {
                    debug!("Session degraded: {}", notice);
                }
                Some(other) => trace!("Ignoring {:?}", other),
            },

            changed = size_rx.changed(), if sizes_open => {
                if changed.is_err() {
                    sizes_open = false;
                    continue;
                }
                let size = *size_rx.borrow_and_update();
                trace!("Local terminal resized to {}", size);
                io.resize_tx.send_replace(Some(size));
            }

            signal = signal_rx.recv(), if signals_open => match signal {
                Some(LocalSignal::Forward(kind)) => {
                    debug!("Forwarding {}", kind);
                    if io.control_tx.send(Control::Signal(kind)).await.is_err() {
                        debug!("Control lane closed, {} not sent", kind);
                    }
                }
                Some(LocalSignal::Detach) => {
                    info!("Leaving the session");
                    return Ok(SessionEnd::Detached);
                }
                None => signals_open = false,
            },
        }
    }
}

/// Write out data already delivered before a close; the exit status if seen
async fn drain_exit(
    io: &mut SessionIo,
    output_tx: &mpsc::Sender<(StreamKind, Bytes)>,
) -> Option<SessionEnd> {
    while let Ok(incoming) = io.data_rx.try_recv() {
        match incoming {
            Incoming::Data(stream, bytes) => write_output(output_tx, stream, bytes).await,
            Incoming::Exit(report) => return Some(SessionEnd::Exited(report.status)),
        }
    }
    None
}

async fn write_output(output_tx: &mpsc::Sender<(StreamKind, Bytes)>, stream: StreamKind, bytes: Bytes) {
    if output_tx.send((stream, bytes)).await.is_err() {
        debug!("Local output closed, discarding {}", stream);
    }
}

/// Move local input onto the ordered data lane
async fn forward_input(mut input_rx: mpsc::Receiver<Bytes>, data_tx: mpsc::Sender<Outgoing>) {
    while let Some(bytes) = input_rx.recv().await {
        if data_tx
            .send(Outgoing::Data(StreamKind::Stdin, bytes))
            .await
            .is_err()
        {
            return;
        }
    }

    debug!("Local input ended");
    let eof = Bytes::from_static(&[END_OF_INPUT]);
    let _ = data_tx.send(Outgoing::Data(StreamKind::Stdin, eof)).await;
}

/// Tell the listener we are done and give the frame a moment to leave
async fn disconnect(io: &mut SessionIo) {
    if io.control_tx.send(Control::Disconnect).await.is_err() {
        return;
    }
    let closed = async {
        while let Some(event) = io.events_rx.recv().await {
            if let SessionEvent::Closed(reason) = event {
                trace!("Closed after disconnect: {}", reason);
                return;
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_GRACE, closed).await.is_err() {
        debug!("Disconnect not confirmed within {:?}", DISCONNECT_GRACE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use msh_core::config::BackoffConfig;
    use msh_core::error::TransportError;
    use msh_core::transport::{MemoryNetwork, MemoryTransport};

    const SERVICE: &str = "test";

    /// Transport whose links never come up
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        fn destination(&self) -> Option<DestinationHash> {
            None
        }

        async fn announce(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn accept(&self) -> Result<Arc<dyn Link>, TransportError> {
            Err(TransportError::NotListening)
        }

        async fn connect(
            &self,
            _destination: DestinationHash,
            _identify: Option<&Identity>,
        ) -> Result<Arc<dyn Link>, TransportError> {
            std::future::pending().await
        }
    }

    fn fast_session() -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_millis(200),
            reorder_wait: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn fast_client() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_millis(300),
            request_timeout: Duration::from_millis(600),
            retry: BackoffConfig {
                initial: Duration::from_millis(50),
                max: Duration::from_millis(100),
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    struct Peer {
        network: MemoryNetwork,
        transport: MemoryTransport,
        identity: Identity,
    }

    impl Peer {
        fn new() -> Self {
            let network = MemoryNetwork::new(256);
            let identity = Identity::generate();
            let transport = network.bind(&identity, SERVICE);
            Self {
                network,
                transport,
                identity,
            }
        }

        fn client(&self) -> ClientSession {
            ClientSession::new(
                Arc::new(self.network.endpoint()),
                self.identity.destination(SERVICE),
                Some(Identity::generate()),
                fast_client(),
                fast_session(),
            )
        }

        async fn accept(&self) -> (LinkDriver, SessionIo) {
            let link = self.transport.accept().await.unwrap();
            LinkDriver::spawn(link, &fast_session()).unwrap()
        }
    }

    async fn next_open(io: &mut SessionIo) -> OpenRequest {
        loop {
            match io.events_rx.recv().await {
                Some(SessionEvent::Control(Control::Open(request))) => return request,
                Some(_) => continue,
                None => panic!("peer driver stopped"),
            }
        }
    }

    fn local() -> (LocalIo, LocalEnds) {
        LocalIo::pair(Some("vt100".into()), TerminalSize::new(30, 90), 16)
    }

    #[tokio::test]
    async fn test_open_is_retransmitted_until_ready() {
        let peer = Peer::new();
        let client = peer.client();
        let mut states = client.subscribe_state();
        let (local, mut ends) = local();
        let running = tokio::spawn(client.run(local));

        let (_driver, mut io) = peer.accept().await;
        let first = next_open(&mut io).await;
        assert_eq!(first.term.as_deref(), Some("vt100"));
        assert_eq!(first.size, TerminalSize::new(30, 90));

        // Ignore the first request; answer the retransmit
        let second = next_open(&mut io).await;
        assert_eq!(second, first);
        io.control_tx.send(Control::Ready { pid: 7 }).await.unwrap();

        states
            .wait_for(|state| *state == ClientState::Active)
            .await
            .unwrap();

        io.data_tx
            .send(Outgoing::Data(StreamKind::Stdout, Bytes::from_static(b"hello")))
            .await
            .unwrap();
        io.data_tx
            .send(Outgoing::Exit(RemoteStatus::Exited(3)))
            .await
            .unwrap();

        let end = running.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Exited(RemoteStatus::Exited(3)));
        let (stream, bytes) = ends.output_rx.recv().await.unwrap();
        assert_eq!(stream, StreamKind::Stdout);
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(*states.borrow(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let peer = Peer::new();
        let (local, _ends) = local();
        let running = tokio::spawn(peer.client().run(local));
        let (_driver, mut io) = peer.accept().await;
        next_open(&mut io).await;

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::RequestTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_refusal_is_authentication_failure() {
        let peer = Peer::new();
        let (local, _ends) = local();
        let running = tokio::spawn(peer.client().run(local));
        let (mut driver, mut io) = peer.accept().await;
        next_open(&mut io).await;

        io.control_tx
            .send(Control::Refused {
                reason: "not allowed".into(),
            })
            .await
            .unwrap();

        let err = running.await.unwrap().unwrap_err();
        match err {
            ClientError::Connection(ConnectionError::AuthenticationFailed(reason)) => {
                assert_eq!(reason, "not allowed")
            }
            other => panic!("unexpected error: {other}"),
        }
        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_while_requesting_is_authentication_failure() {
        let peer = Peer::new();
        let (local, _ends) = local();
        let running = tokio::spawn(peer.client().run(local));
        let link = peer.transport.accept().await.unwrap();
        link.close().await;

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_while_requesting_ends_session() {
        let peer = Peer::new();
        let (local, mut ends) = local();
        let running = tokio::spawn(peer.client().run(local));
        let (_driver, mut io) = peer.accept().await;
        next_open(&mut io).await;

        io.data_tx
            .send(Outgoing::Data(
                StreamKind::Stderr,
                Bytes::from_static(b"meshsh: no such program\r\n"),
            ))
            .await
            .unwrap();
        io.data_tx
            .send(Outgoing::Exit(RemoteStatus::SpawnFailed("nope".into())))
            .await
            .unwrap();

        let end = running.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Exited(RemoteStatus::SpawnFailed("nope".into())));
        let (stream, _) = ends.output_rx.recv().await.unwrap();
        assert_eq!(stream, StreamKind::Stderr);

        // The client says goodbye
        let mut saw_disconnect = false;
        while let Some(event) = io.events_rx.recv().await {
            if event == SessionEvent::Control(Control::Disconnect) {
                saw_disconnect = true;
            }
            if matches!(event, SessionEvent::Closed(_)) {
                break;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let client = ClientSession::new(
            Arc::new(StalledTransport),
            DestinationHash([1; 16]),
            None,
            fast_client(),
            fast_session(),
        );
        let (local, _ends) = local();
        let err = client.run(local).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let network = MemoryNetwork::new(256);
        let client = ClientSession::new(
            Arc::new(network.endpoint()),
            DestinationHash([2; 16]),
            None,
            fast_client(),
            fast_session(),
        );
        let (local, _ends) = local();
        let err = client.run(local).await.unwrap_err();
        assert!(matches!(err, ClientError::Link(_)));
    }

    #[tokio::test]
    async fn test_signal_while_connecting_detaches() {
        let client = ClientSession::new(
            Arc::new(StalledTransport),
            DestinationHash([1; 16]),
            None,
            ClientConfig {
                connect_timeout: Duration::from_secs(30),
                ..fast_client()
            },
            fast_session(),
        );
        let (local, ends) = local();
        ends.signal_tx
            .send(LocalSignal::Forward(SignalKind::Interrupt))
            .await
            .unwrap();
        assert_eq!(client.run(local).await.unwrap(), SessionEnd::Detached);
    }

    #[tokio::test]
    async fn test_active_session_forwards_input_signals_and_resizes() {
        let peer = Peer::new();
        let client = peer.client();
        let mut states = client.subscribe_state();
        let (local, ends) = local();
        let running = tokio::spawn(client.run(local));

        let (_driver, mut io) = peer.accept().await;
        next_open(&mut io).await;
        io.control_tx.send(Control::Ready { pid: 1 }).await.unwrap();
        states
            .wait_for(|state| *state == ClientState::Active)
            .await
            .unwrap();

        ends.input_tx.send(Bytes::from_static(b"ls\r")).await.unwrap();
        match io.data_rx.recv().await.unwrap() {
            Incoming::Data(StreamKind::Stdin, bytes) => assert_eq!(&bytes[..], b"ls\r"),
            other => panic!("unexpected {:?}", other),
        }

        ends.signal_tx
            .send(LocalSignal::Forward(SignalKind::Interrupt))
            .await
            .unwrap();
        loop {
            match io.events_rx.recv().await.unwrap() {
                SessionEvent::Control(Control::Signal(kind)) => {
                    assert_eq!(kind, SignalKind::Interrupt);
                    break;
                }
                _ => continue,
            }
        }

        ends.size_tx.send_replace(TerminalSize::new(40, 120));
        io.resize_rx
            .wait_for(|size| *size == Some(TerminalSize::new(40, 120)))
            .await
            .unwrap();

        // End of local input becomes Ctrl-D
        drop(ends.input_tx);
        match io.data_rx.recv().await.unwrap() {
            Incoming::Data(StreamKind::Stdin, bytes) => assert_eq!(&bytes[..], &[END_OF_INPUT]),
            other => panic!("unexpected {:?}", other),
        }

        ends.signal_tx.send(LocalSignal::Detach).await.unwrap();
        assert_eq!(running.await.unwrap().unwrap(), SessionEnd::Detached);
    }

    #[tokio::test]
    async fn test_silent_link_is_lost() {
        let peer = Peer::new();
        let client = peer.client();
        let mut states = client.subscribe_state();
        let (local, _ends) = local();
        let running = tokio::spawn(client.run(local));

        let (_driver, mut io) = peer.accept().await;
        next_open(&mut io).await;
        io.control_tx.send(Control::Ready { pid: 1 }).await.unwrap();
        states
            .wait_for(|state| *state == ClientState::Active)
            .await
            .unwrap();

        peer.network.set_blackhole(true);
        let err = running.await.unwrap().unwrap_err();
        match err {
            ClientError::Connection(ConnectionError::LinkLost(reason)) => {
                assert_eq!(reason, CloseReason::KeepaliveTimeout.to_string())
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
