//! Listener sessions driven by a bare link-driver peer

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use msh_core::config::{ListenerConfig, SessionConfig};
use msh_core::session::{CloseReason, Incoming, LinkDriver, Outgoing, SessionEvent, SessionIo};
use msh_core::transport::{MemoryNetwork, MemoryTransport, Transport};
use msh_core::Identity;
use msh_listener::{AllowList, Authenticator, ListenerContext, ListenerServer, SessionOutcome};
use msh_protocol::{Control, OpenRequest, RemoteStatus, SessionId, StreamKind, TerminalSize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SERVICE: &str = "test";

fn session_config() -> SessionConfig {
    SessionConfig {
        keepalive_interval: Duration::from_millis(200),
        keepalive_timeout_multiple: 3,
        reorder_wait: Duration::from_millis(200),
        linger: Duration::from_secs(1),
        ..Default::default()
    }
}

struct Harness {
    network: MemoryNetwork,
    listener_identity: Identity,
    outcomes: mpsc::UnboundedReceiver<(SessionId, SessionOutcome)>,
    cancel: CancellationToken,
    server: Arc<ListenerServer>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(program: &[&str], auth: Authenticator) -> Self {
        let network = MemoryNetwork::new(256);
        let listener_identity = Identity::generate();
        let transport: Arc<dyn Transport> = Arc::new(network.bind(&listener_identity, SERVICE));

        let config = ListenerConfig {
            program: program.iter().map(|s| s.to_string()).collect(),
            no_auth: true,
            announce: false,
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let ctx = ListenerContext::new(config, session_config())
            .unwrap()
            .with_auth(auth);

        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let server = Arc::new(
            ListenerServer::new(transport, Arc::new(ctx), cancel.clone()).with_outcomes(outcome_tx),
        );
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                server.run().await.unwrap();
            }
        });

        Self {
            network,
            listener_identity,
            outcomes,
            cancel,
            server,
            task,
        }
    }

    async fn connect(&self, identity: Option<&Identity>) -> (LinkDriver, SessionIo, MemoryTransport) {
        let endpoint = self.network.endpoint();
        let link = endpoint
            .connect(self.listener_identity.destination(SERVICE), identity)
            .await
            .unwrap();
        let (driver, io) = LinkDriver::spawn(link, &session_config()).unwrap();
        (driver, io, endpoint)
    }

    async fn outcome(&mut self) -> SessionOutcome {
        tokio::time::timeout(Duration::from_secs(10), self.outcomes.recv())
            .await
            .expect("no session outcome")
            .expect("server stopped")
            .1
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Fails quietly if the listener already closed the link
async fn open(io: &SessionIo) {
    let _ = io
        .control_tx
        .send(Control::Open(OpenRequest::new(
            Some("xterm".into()),
            TerminalSize::new(24, 80),
        )))
        .await;
}

async fn next_event(io: &mut SessionIo) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), io.events_rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn collect_until_exit(io: &mut SessionIo) -> (String, String, RemoteStatus) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), io.data_rx.recv())
            .await
            .expect("timed out waiting for output")
        {
            Some(Incoming::Data(StreamKind::Stdout, bytes)) => stdout.extend_from_slice(&bytes),
            Some(Incoming::Data(StreamKind::Stderr, bytes)) => stderr.extend_from_slice(&bytes),
            Some(Incoming::Data(StreamKind::Stdin, _)) => {}
            Some(Incoming::Exit(report)) => {
                return (
                    String::from_utf8_lossy(&stdout).into_owned(),
                    String::from_utf8_lossy(&stderr).into_owned(),
                    report.status,
                )
            }
            None => panic!("link closed before exit"),
        }
    }
}

#[tokio::test]
async fn test_echo_runs_and_reports_exit() {
    let mut harness = Harness::start(&["/bin/sh", "-c", "echo hi"], Authenticator::AllowAll);
    let (_driver, mut io, _endpoint) = harness.connect(None).await;

    open(&io).await;
    assert!(matches!(
        next_event(&mut io).await,
        SessionEvent::Control(Control::Ready { .. })
    ));

    let (stdout, _, status) = collect_until_exit(&mut io).await;
    assert!(stdout.contains("hi"));
    assert_eq!(status, RemoteStatus::Exited(0));

    io.control_tx.send(Control::Disconnect).await.unwrap();
    assert_eq!(
        harness.outcome().await,
        SessionOutcome::Exited(RemoteStatus::Exited(0))
    );
    harness.stop().await;
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let mut harness = Harness::start(&["/bin/sh", "-c", "exit 42"], Authenticator::AllowAll);
    let (_driver, mut io, _endpoint) = harness.connect(None).await;

    open(&io).await;
    let (_, _, status) = collect_until_exit(&mut io).await;
    assert_eq!(status, RemoteStatus::Exited(42));

    io.control_tx.send(Control::Disconnect).await.unwrap();
    assert_eq!(
        harness.outcome().await,
        SessionOutcome::Exited(RemoteStatus::Exited(42))
    );
    harness.stop().await;
}

#[tokio::test]
async fn test_unlisted_peer_is_refused_and_nothing_runs() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("spawned");
    let command = format!("touch {}", marker.display());

    let allowed = Identity::generate();
    let intruder = Identity::generate();
    let mut list = AllowList::new();
    list.add(allowed.hash());

    let mut harness = Harness::start(&["/bin/sh", "-c", &command], Authenticator::AllowList(list));
    let (_driver, mut io, _endpoint) = harness.connect(Some(&intruder)).await;
    open(&io).await;

    match next_event(&mut io).await {
        SessionEvent::Control(Control::Refused { reason }) => {
            assert!(reason.contains(&intruder.hash().to_string()))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        next_event(&mut io).await,
        SessionEvent::Closed(CloseReason::LinkClosed)
    );
    assert!(matches!(harness.outcome().await, SessionOutcome::Refused(_)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!marker.exists());
    harness.stop().await;
}

#[tokio::test]
async fn test_anonymous_peer_refused_by_allow_list() {
    let mut list = AllowList::new();
    list.add(Identity::generate().hash());

    let mut harness = Harness::start(&["/bin/sh", "-c", "true"], Authenticator::AllowList(list));
    let (_driver, mut io, _endpoint) = harness.connect(None).await;

    assert!(matches!(
        next_event(&mut io).await,
        SessionEvent::Control(Control::Refused { .. })
    ));
    assert!(matches!(harness.outcome().await, SessionOutcome::Refused(_)));
    harness.stop().await;
}

#[tokio::test]
async fn test_remote_identity_reaches_child() {
    let client = Identity::generate();
    let mut list = AllowList::new();
    list.add(client.hash());

    let mut harness = Harness::start(
        &["/bin/sh", "-c", "echo id=$MESHSH_REMOTE_IDENTITY term=$TERM"],
        Authenticator::AllowList(list),
    );
    let (_driver, mut io, _endpoint) = harness.connect(Some(&client)).await;
    open(&io).await;

    let (stdout, _, _) = collect_until_exit(&mut io).await;
    assert!(stdout.contains(&format!("id={}", client.hash())));
    assert!(stdout.contains("term=xterm"));

    io.control_tx.send(Control::Disconnect).await.unwrap();
    harness.outcome().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_missing_program_reports_spawn_failure() {
    let mut harness = Harness::start(&["/nonexistent/meshsh-program"], Authenticator::AllowAll);
    let (_driver, mut io, _endpoint) = harness.connect(None).await;
    open(&io).await;

    let (_, stderr, status) = collect_until_exit(&mut io).await;
    assert!(stderr.contains("meshsh:"));
    assert!(matches!(status, RemoteStatus::SpawnFailed(_)));

    io.control_tx.send(Control::Disconnect).await.unwrap();
    assert!(matches!(
        harness.outcome().await,
        SessionOutcome::Exited(RemoteStatus::SpawnFailed(_))
    ));
    harness.stop().await;
}

#[tokio::test]
async fn test_input_and_resize_reach_program() {
    let mut harness = Harness::start(
        &["/bin/sh", "-c", "read line; stty size; echo got:$line"],
        Authenticator::AllowAll,
    );
    let (_driver, mut io, _endpoint) = harness.connect(None).await;
    open(&io).await;
    assert!(matches!(
        next_event(&mut io).await,
        SessionEvent::Control(Control::Ready { .. })
    ));

    io.resize_tx.send_replace(Some(TerminalSize::new(50, 132)));
    tokio::time::sleep(Duration::from_millis(300)).await;
    io.data_tx
        .send(Outgoing::Data(StreamKind::Stdin, Bytes::from_static(b"ping\r")))
        .await
        .unwrap();

    let (stdout, _, status) = collect_until_exit(&mut io).await;
    assert!(stdout.contains("50 132"));
    assert!(stdout.contains("got:ping"));
    assert_eq!(status, RemoteStatus::Exited(0));

    io.control_tx.send(Control::Disconnect).await.unwrap();
    harness.outcome().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_silent_link_closes_session_and_process() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("finished");
    let command = format!("sleep 30; touch {}", marker.display());

    let mut harness = Harness::start(&["/bin/sh", "-c", &command], Authenticator::AllowAll);
    let (driver, mut io, _endpoint) = harness.connect(None).await;
    open(&io).await;
    assert!(matches!(
        next_event(&mut io).await,
        SessionEvent::Control(Control::Ready { .. })
    ));

    harness.network.set_blackhole(true);

    assert_eq!(
        next_event(&mut io).await,
        SessionEvent::Closed(CloseReason::KeepaliveTimeout)
    );
    assert!(!driver.is_running());
    assert_eq!(
        harness.outcome().await,
        SessionOutcome::LinkLost(CloseReason::KeepaliveTimeout)
    );
    assert!(!marker.exists());
    harness.stop().await;
}

#[tokio::test]
async fn test_interrupt_stops_foreground_program() {
    let mut harness = Harness::start(&["/bin/sh", "-c", "sleep 30"], Authenticator::AllowAll);
    let (_driver, mut io, _endpoint) = harness.connect(None).await;
    open(&io).await;
    assert!(matches!(
        next_event(&mut io).await,
        SessionEvent::Control(Control::Ready { .. })
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    io.control_tx
        .send(Control::Signal(msh_protocol::SignalKind::Interrupt))
        .await
        .unwrap();

    let (_, _, status) = collect_until_exit(&mut io).await;
    assert_ne!(status, RemoteStatus::Exited(0));

    io.control_tx.send(Control::Disconnect).await.unwrap();
    harness.outcome().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_ends_running_sessions() {
    let mut harness = Harness::start(&["/bin/sh", "-c", "sleep 30"], Authenticator::AllowAll);
    let (_driver, mut io, _endpoint) = harness.connect(None).await;
    open(&io).await;
    assert!(matches!(
        next_event(&mut io).await,
        SessionEvent::Control(Control::Ready { .. })
    ));

    assert_eq!(harness.server.active_sessions(), 1);
    harness.cancel.cancel();
    assert_eq!(harness.outcome().await, SessionOutcome::Shutdown);
    assert_eq!(harness.server.active_sessions(), 0);
    assert_eq!(
        next_event(&mut io).await,
        SessionEvent::Closed(CloseReason::LinkClosed)
    );
    harness.stop().await;
}
