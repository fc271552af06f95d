//! Link driver tests over the in-memory transport

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use msh_core::config::SessionConfig;
use msh_core::session::{CloseReason, Incoming, LinkDriver, Outgoing, SessionEvent, SessionIo};
use msh_core::transport::{Impairments, Link, MemoryNetwork, MemoryTransport, Transport};
use msh_core::Identity;
use msh_protocol::{Control, DegradedNotice, RemoteStatus, SignalKind, StreamKind, TerminalSize};

fn fast_config() -> SessionConfig {
    SessionConfig {
        keepalive_interval: Duration::from_millis(100),
        keepalive_timeout_multiple: 3,
        reorder_wait: Duration::from_millis(200),
        resize_coalesce: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn linked(network: &MemoryNetwork) -> (MemoryTransport, Arc<dyn Link>, Arc<dyn Link>) {
    let listener_identity = Identity::generate();
    let client_identity = Identity::generate();
    let listener = network.bind(&listener_identity, "test");

    let client = network
        .endpoint()
        .connect(listener_identity.destination("test"), Some(&client_identity))
        .await
        .unwrap();
    let server = listener.accept().await.unwrap();
    (listener, client, server)
}

/// Read stream data until the exit report arrives
async fn read_until_exit(io: &mut SessionIo, stream: StreamKind) -> (Vec<u8>, RemoteStatus) {
    let mut data = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), io.data_rx.recv())
            .await
            .expect("timed out waiting for data")
        {
            Some(Incoming::Data(s, bytes)) if s == stream => data.extend_from_slice(&bytes),
            Some(Incoming::Data(..)) => {}
            Some(Incoming::Exit(report)) => return (data, report.status),
            None => panic!("data channel closed before exit"),
        }
    }
}

async fn next_event(io: &mut SessionIo) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), io.events_rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_output_then_exit_over_impaired_link() {
    let network = MemoryNetwork::with_impairments(
        64,
        Impairments {
            duplicate_every: Some(3),
            delay_every: Some(4),
            delay: Duration::from_millis(20),
            ..Default::default()
        },
    );
    let (_listener, client_link, server_link) = linked(&network).await;
    let config = fast_config();

    let (_client, mut client_io) = LinkDriver::spawn(client_link, &config).unwrap();
    let (_server, server_io) = LinkDriver::spawn(server_link, &config).unwrap();

    let output: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    for chunk in output.chunks(300) {
        server_io
            .data_tx
            .send(Outgoing::Data(StreamKind::Stdout, Bytes::copy_from_slice(chunk)))
            .await
            .unwrap();
    }
    server_io
        .data_tx
        .send(Outgoing::Exit(RemoteStatus::Exited(7)))
        .await
        .unwrap();

    let (received, status) = read_until_exit(&mut client_io, StreamKind::Stdout).await;
    assert_eq!(received, output);
    assert_eq!(status, RemoteStatus::Exited(7));
}

#[tokio::test]
async fn test_data_after_exit_is_not_sent() {
    let network = MemoryNetwork::new(128);
    let (_listener, client_link, server_link) = linked(&network).await;
    let config = fast_config();

    let (_client, mut client_io) = LinkDriver::spawn(client_link, &config).unwrap();
    let (_server, server_io) = LinkDriver::spawn(server_link, &config).unwrap();

    server_io
        .data_tx
        .send(Outgoing::Data(StreamKind::Stdout, Bytes::from_static(b"hi\n")))
        .await
        .unwrap();
    server_io
        .data_tx
        .send(Outgoing::Exit(RemoteStatus::Exited(0)))
        .await
        .unwrap();
    server_io
        .data_tx
        .send(Outgoing::Data(StreamKind::Stdout, Bytes::from_static(b"late")))
        .await
        .unwrap();
    server_io
        .data_tx
        .send(Outgoing::Exit(RemoteStatus::Exited(1)))
        .await
        .unwrap();

    let (received, status) = read_until_exit(&mut client_io, StreamKind::Stdout).await;
    assert_eq!(received, b"hi\n");
    assert_eq!(status, RemoteStatus::Exited(0));

    let extra = tokio::time::timeout(Duration::from_millis(200), client_io.data_rx.recv()).await;
    assert!(extra.is_err(), "nothing may follow the exit status");
}

#[tokio::test]
async fn test_signal_and_stdin_reach_peer() {
    let network = MemoryNetwork::new(128);
    let (_listener, client_link, server_link) = linked(&network).await;
    let config = fast_config();

    let (_client, client_io) = LinkDriver::spawn(client_link, &config).unwrap();
    let (_server, mut server_io) = LinkDriver::spawn(server_link, &config).unwrap();

    client_io
        .data_tx
        .send(Outgoing::Data(StreamKind::Stdin, Bytes::from_static(b"ls\r")))
        .await
        .unwrap();
    client_io
        .control_tx
        .send(Control::Signal(SignalKind::Interrupt))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut server_io).await,
        SessionEvent::Control(Control::Signal(SignalKind::Interrupt))
    );
    match server_io.data_rx.recv().await {
        Some(Incoming::Data(StreamKind::Stdin, bytes)) => assert_eq!(bytes, Bytes::from_static(b"ls\r")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_resize_coalesces_to_latest() {
    let network = MemoryNetwork::new(128);
    let (_listener, client_link, server_link) = linked(&network).await;
    let config = fast_config();

    let (_client, client_io) = LinkDriver::spawn(client_link, &config).unwrap();
    let (_server, mut server_io) = LinkDriver::spawn(server_link, &config).unwrap();

    for cols in 80..120u16 {
        client_io.resize_tx.send_replace(Some(TerminalSize::new(24, cols)));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let last = TerminalSize::new(24, 119);
    let observed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            server_io.resize_rx.changed().await.unwrap();
            if *server_io.resize_rx.borrow_and_update() == Some(last) {
                return;
            }
        }
    })
    .await;
    assert!(observed.is_ok(), "latest size never arrived");
}

#[tokio::test]
async fn test_disconnect_closes_both_sides() {
    let network = MemoryNetwork::new(128);
    let (_listener, client_link, server_link) = linked(&network).await;
    let config = fast_config();

    let (client, mut client_io) = LinkDriver::spawn(client_link, &config).unwrap();
    let (_server, mut server_io) = LinkDriver::spawn(server_link, &config).unwrap();
    let stopped = client.cancel_token();

    client_io.control_tx.send(Control::Disconnect).await.unwrap();

    assert_eq!(
        next_event(&mut server_io).await,
        SessionEvent::Control(Control::Disconnect)
    );
    assert_eq!(
        next_event(&mut server_io).await,
        SessionEvent::Closed(CloseReason::LinkClosed)
    );
    assert_eq!(
        next_event(&mut client_io).await,
        SessionEvent::Closed(CloseReason::Disconnected)
    );
    assert!(!client.is_running());
    assert!(stopped.is_cancelled());
}

#[tokio::test]
async fn test_silent_link_times_out_on_both_sides() {
    let network = MemoryNetwork::new(128);
    let (_listener, client_link, server_link) = linked(&network).await;
    let config = fast_config();

    let (client, mut client_io) = LinkDriver::spawn(client_link, &config).unwrap();
    let (server, mut server_io) = LinkDriver::spawn(server_link, &config).unwrap();

    // Keepalives hold the link up while it is healthy
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client.is_running());
    assert!(server.is_running());

    network.set_blackhole(true);

    assert_eq!(
        next_event(&mut client_io).await,
        SessionEvent::Closed(CloseReason::KeepaliveTimeout)
    );
    assert_eq!(
        next_event(&mut server_io).await,
        SessionEvent::Closed(CloseReason::KeepaliveTimeout)
    );
    assert!(!client.is_running());
    assert!(!server.is_running());
}

#[tokio::test]
async fn test_lost_frames_degrade_both_sides() {
    let network = MemoryNetwork::new(64);
    let (_listener, client_link, server_link) = linked(&network).await;
    let config = fast_config();

    let (_client, mut client_io) = LinkDriver::spawn(client_link, &config).unwrap();
    let (_server, mut server_io) = LinkDriver::spawn(server_link, &config).unwrap();

    // First message of the burst is dropped
    network.set_impairments(Impairments {
        drop_every: Some(1),
        ..Default::default()
    });
    server_io
        .data_tx
        .send(Outgoing::Data(StreamKind::Stdout, Bytes::from_static(b"lost")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    network.set_impairments(Impairments::default());
    server_io
        .data_tx
        .send(Outgoing::Data(StreamKind::Stdout, Bytes::from_static(b"kept")))
        .await
        .unwrap();

    match next_event(&mut client_io).await {
        SessionEvent::Degraded(DegradedNotice::Lost {
            stream, first_lost, ..
        }) => {
            assert_eq!(stream, StreamKind::Stdout);
            assert_eq!(first_lost, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
    match client_io.data_rx.recv().await {
        Some(Incoming::Data(StreamKind::Stdout, bytes)) => assert_eq!(bytes, Bytes::from_static(b"kept")),
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut server_io).await {
        SessionEvent::Control(Control::Degraded(DegradedNotice::Lost { first_lost, .. })) => {
            assert_eq!(first_lost, 0)
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_frame_degrades_both_sides() {
    let network = MemoryNetwork::new(128);
    let (_listener, client_link, server_link) = linked(&network).await;
    let config = fast_config();
    let raw = Arc::clone(&server_link);

    let (client, mut client_io) = LinkDriver::spawn(client_link, &config).unwrap();
    let (_server, mut server_io) = LinkDriver::spawn(server_link, &config).unwrap();

    raw.send(Bytes::from_static(&[0xEE, 0, 0, 0, 0, 0, 0])).await.unwrap();

    assert_eq!(
        next_event(&mut client_io).await,
        SessionEvent::Degraded(DegradedNotice::Malformed { count: 1 })
    );
    assert_eq!(
        next_event(&mut server_io).await,
        SessionEvent::Control(Control::Degraded(DegradedNotice::Malformed { count: 1 }))
    );

    // One bad frame does not end the session
    server_io
        .data_tx
        .send(Outgoing::Data(StreamKind::Stdout, Bytes::from_static(b"still here")))
        .await
        .unwrap();
    match client_io.data_rx.recv().await {
        Some(Incoming::Data(StreamKind::Stdout, bytes)) => {
            assert_eq!(bytes, Bytes::from_static(b"still here"))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(client.is_running());
}
