//! Per-session link driver
//!
//! Runs the two tasks that sit between a link and the session's owner:
//!
//! - the **writer** sends, in priority order, queued control frames, the
//!   latest terminal size, keepalives when idle, and finally stream data,
//!   checking the control lane again between the chunks of a large write
//! - the **reader** decodes and reorders inbound frames, routes them to the
//!   owner, and declares the link dead when nothing arrives for the
//!   keepalive timeout
//!
//! Inbound stream data waits in a backlog when the owner is slow; link
//! reads pause once the backlog reaches `inbound_backlog_limit` bytes, so
//! the reader itself never blocks on the data sink.

use bytes::Bytes;
use msh_protocol::{
    Control, DegradedNotice, ExitReport, FrameCodec, RemoteStatus, SessionId, StreamKind,
    TerminalSize,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::liveness::Liveness;
use super::multiplexer::{Inbound, InboundEvent, Outbound};
use crate::config::SessionConfig;
use crate::error::{MshError, TransportError};
use crate::transport::Link;

/// Capacity of the priority control lane
const CONTROL_LANE: usize = 32;
/// Capacity of the event channel to the owner
const EVENT_QUEUE: usize = 64;
/// Stand-in deadline for disabled timers
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

/// Data queued for the peer, sent in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Data(StreamKind, Bytes),
    /// Terminal exit status; sent after all data queued before it
    Exit(RemoteStatus),
}

/// Data received from the peer, in stream order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Data(StreamKind, Bytes),
    /// Delivered after all output the report accounts for
    Exit(ExitReport),
}

impl Incoming {
    fn len(&self) -> usize {
        match self {
            Incoming::Data(_, bytes) => bytes.len(),
            Incoming::Exit(_) => 0,
        }
    }
}

/// Why a session's link driver stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The link was closed by the transport or the peer
    LinkClosed,
    /// Nothing was received for the keepalive timeout
    KeepaliveTimeout,
    /// Too many malformed frames
    MalformedStorm,
    /// A `Disconnect` was sent to the peer
    Disconnected,
    /// Shut down locally
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::LinkClosed => write!(f, "link closed"),
            CloseReason::KeepaliveTimeout => write!(f, "keepalive timeout"),
            CloseReason::MalformedStorm => write!(f, "malformed frame storm"),
            CloseReason::Disconnected => write!(f, "disconnected"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Non-data events for the session owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Control frame from the peer (resize excluded, see `resize_rx`)
    Control(Control),
    /// Inbound frames were lost or dropped as malformed; the peer has been told
    Degraded(DegradedNotice),
    /// The driver stopped
    Closed(CloseReason),
}

/// Channels connecting a session owner to its link driver
pub struct SessionIo {
    /// Ordered data lane to the peer; bounded by `data_window`
    pub data_tx: mpsc::Sender<Outgoing>,
    /// Priority control lane to the peer
    pub control_tx: mpsc::Sender<Control>,
    /// Local terminal size; only the latest value is sent
    pub resize_tx: watch::Sender<Option<TerminalSize>>,
    /// Stream data and exit status from the peer
    pub data_rx: mpsc::Receiver<Incoming>,
    /// Latest terminal size requested by the peer
    pub resize_rx: watch::Receiver<Option<TerminalSize>>,
    /// Control events and driver shutdown
    pub events_rx: mpsc::Receiver<SessionEvent>,
}

/// Handle to the tasks driving one session's link
pub struct LinkDriver {
    session_id: SessionId,
    link: Arc<dyn Link>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkDriver {
    /// Start driving a link
    pub fn spawn(link: Arc<dyn Link>, config: &SessionConfig) -> Result<(Self, SessionIo), MshError> {
        let codec = FrameCodec::new(link.mtu())?;
        let session_id = SessionId::for_link(link.id());
        let cancel = CancellationToken::new();
        let disconnected = Arc::new(AtomicBool::new(false));

        let (data_tx, data_out_rx) = mpsc::channel(config.data_window);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_LANE);
        let (resize_tx, resize_out_rx) = watch::channel(None);
        let (data_in_tx, data_rx) = mpsc::channel(config.data_window);
        let (resize_in_tx, resize_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let writer = Writer {
            sender: FrameSender {
                link: Arc::clone(&link),
                outbound: Outbound::new(codec),
                last_sent: Instant::now(),
            },
            control_rx,
            resize_rx: resize_out_rx,
            data_rx: data_out_rx,
            keepalive_interval: config.keepalive_interval,
            resize_coalesce: config.resize_coalesce,
            disconnected: Arc::clone(&disconnected),
            cancel: cancel.clone(),
        };

        let reader = Reader {
            link: Arc::clone(&link),
            inbound: Inbound::new(codec, config),
            liveness: Liveness::new(config.keepalive_timeout(), Instant::now()),
            router: Router {
                backlog: VecDeque::new(),
                backlog_bytes: 0,
                sink_closed: false,
                data_tx: data_in_tx,
                resize_tx: resize_in_tx,
                events_tx,
                peer_control_tx: control_tx.clone(),
            },
            backlog_limit: config.inbound_backlog_limit,
            disconnected,
            cancel: cancel.clone(),
        };

        debug!("{}: starting link driver (mtu {})", session_id, link.mtu());
        let tasks = vec![
            tokio::spawn(writer.run(session_id)),
            tokio::spawn(reader.run(session_id)),
        ];

        Ok((
            Self {
                session_id,
                link,
                cancel,
                tasks,
            },
            SessionIo {
                data_tx,
                control_tx,
                resize_tx,
                data_rx,
                resize_rx,
                events_rx,
            },
        ))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Token cancelled when the driver stops for any reason
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop both tasks and close the link; idempotent
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.link.close().await;
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("{}: link driver task failed: {}", self.session_id, e);
            }
        }
    }
}

impl Drop for LinkDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct FrameSender {
    link: Arc<dyn Link>,
    outbound: Outbound,
    last_sent: Instant,
}

impl FrameSender {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.link.send(message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Send a control frame; returns true if it ended the session
    async fn send_control(&mut self, control: Control) -> Result<bool, TransportError> {
        let disconnect = matches!(control, Control::Disconnect);
        match self.outbound.control_frame(&control) {
            Ok(message) => self.send(message).await?,
            Err(e) => warn!("Dropping {} frame: {}", control.frame_type(), e),
        }
        Ok(disconnect)
    }
}

struct Writer {
    sender: FrameSender,
    control_rx: mpsc::Receiver<Control>,
    resize_rx: watch::Receiver<Option<TerminalSize>>,
    data_rx: mpsc::Receiver<Outgoing>,
    keepalive_interval: Duration,
    resize_coalesce: Duration,
    disconnected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Writer {
    async fn run(mut self, session_id: SessionId) {
        match self.write_loop().await {
            Ok(true) => {
                debug!("{}: sent disconnect", session_id);
                self.disconnected.store(true, Ordering::SeqCst);
                self.sender.link.close().await;
                self.cancel.cancel();
            }
            Ok(false) => trace!("{}: writer stopped", session_id),
            // The reader still drains what the peer sent before the link closed
            Err(e) => debug!("{}: send failed: {}", session_id, e),
        }
    }

    /// Returns true when the session ended with a sent `Disconnect`
    async fn write_loop(&mut self) -> Result<bool, TransportError> {
        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let resize_timer = tokio::time::sleep(FAR_FUTURE);
        tokio::pin!(resize_timer);
        let mut resize_pending = false;
        let mut resize_open = true;
        let mut last_resize: Option<(TerminalSize, Instant)> = None;
        let mut data_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(false),

                Some(control) = self.control_rx.recv() => {
                    if self.sender.send_control(control).await? {
                        return Ok(true);
                    }
                }

                changed = self.resize_rx.changed(), if resize_open && !resize_pending => {
                    if changed.is_err() {
                        resize_open = false;
                        continue;
                    }
                    let Some(size) = *self.resize_rx.borrow_and_update() else {
                        continue;
                    };
                    let now = Instant::now();
                    match last_resize {
                        Some((last, _)) if last == size => {}
                        Some((_, at)) if now < at + self.resize_coalesce => {
                            resize_timer.as_mut().reset(at + self.resize_coalesce);
                            resize_pending = true;
                        }
                        _ => {
                            self.sender.send_control(Control::Resize(size)).await?;
                            last_resize = Some((size, now));
                        }
                    }
                }

                _ = &mut resize_timer, if resize_pending => {
                    resize_pending = false;
                    let latest = *self.resize_rx.borrow_and_update();
                    if let Some(size) = latest {
                        if last_resize.map(|(last, _)| last) != Some(size) {
                            self.sender.send_control(Control::Resize(size)).await?;
                            last_resize = Some((size, Instant::now()));
                        }
                    }
                }

                _ = keepalive.tick() => {
                    if self.sender.last_sent.elapsed() >= self.keepalive_interval {
                        self.sender.send_control(Control::Keepalive).await?;
                    }
                }

                outgoing = self.data_rx.recv(), if data_open => match outgoing {
                    Some(outgoing) => {
                        if self.send_outgoing(outgoing).await? {
                            return Ok(true);
                        }
                    }
                    None => data_open = false,
                },
            }
        }
    }

    /// Send queued data, letting control frames cut in between chunks
    async fn send_outgoing(&mut self, outgoing: Outgoing) -> Result<bool, TransportError> {
        let frames = match outgoing {
            Outgoing::Data(stream, bytes) => {
                match self.sender.outbound.data_frames(stream, &bytes) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!("Discarding {} bytes of {}: {}", bytes.len(), stream, e);
                        return Ok(false);
                    }
                }
            }
            Outgoing::Exit(status) => match self.sender.outbound.exit_frame(status) {
                Ok(frame) => vec![frame],
                Err(e) => {
                    warn!("Not sending exit status: {}", e);
                    return Ok(false);
                }
            },
        };

        for frame in frames {
            while let Ok(control) = self.control_rx.try_recv() {
                if self.sender.send_control(control).await? {
                    return Ok(true);
                }
            }
            self.sender.send(frame).await?;
        }
        Ok(false)
    }
}

struct Router {
    backlog: VecDeque<Incoming>,
    backlog_bytes: usize,
    sink_closed: bool,
    data_tx: mpsc::Sender<Incoming>,
    resize_tx: watch::Sender<Option<TerminalSize>>,
    events_tx: mpsc::Sender<SessionEvent>,
    peer_control_tx: mpsc::Sender<Control>,
}

impl Router {
    fn enqueue(&mut self, item: Incoming) {
        if self.sink_closed {
            return;
        }
        self.backlog_bytes += item.len();
        self.backlog.push_back(item);
    }

    async fn route(&mut self, session_id: SessionId, events: Vec<InboundEvent>) {
        for event in events {
            match event {
                InboundEvent::Data(stream, bytes) => self.enqueue(Incoming::Data(stream, bytes)),
                InboundEvent::Exit(report) => {
                    debug!("{}: remote {}", session_id, report.status);
                    self.enqueue(Incoming::Exit(report));
                }
                InboundEvent::Control(Control::Resize(size)) => {
                    self.resize_tx.send_replace(Some(size));
                }
                InboundEvent::Control(control) => {
                    if let Control::Degraded(notice) = &control {
                        warn!("{}: peer reports degraded session: {}", session_id, notice);
                    }
                    let _ = self.events_tx.send(SessionEvent::Control(control)).await;
                }
                InboundEvent::Degraded(notice) => {
                    warn!("{}: session degraded, {}", session_id, notice);
                    if self
                        .peer_control_tx
                        .try_send(Control::Degraded(notice))
                        .is_err()
                    {
                        debug!("{}: control lane full, degraded notice not sent", session_id);
                    }
                    let _ = self.events_tx.send(SessionEvent::Degraded(notice)).await;
                }
            }
        }
    }
}

struct Reader {
    link: Arc<dyn Link>,
    inbound: Inbound,
    liveness: Liveness,
    router: Router,
    backlog_limit: usize,
    disconnected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(mut self, session_id: SessionId) {
        let mut reason = self.read_loop(session_id).await;
        if self.disconnected.load(Ordering::SeqCst) {
            reason = CloseReason::Disconnected;
        }
        match reason {
            CloseReason::Shutdown | CloseReason::Disconnected => {
                debug!("{}: reader stopped ({})", session_id, reason)
            }
            CloseReason::LinkClosed => info!("{}: link closed", session_id),
            CloseReason::KeepaliveTimeout => warn!(
                "{}: no frames for {:?}, link lost",
                session_id,
                self.liveness.timeout()
            ),
            CloseReason::MalformedStorm => warn!("{}: closing after malformed frames", session_id),
        }

        if reason != CloseReason::Shutdown {
            self.flush_backlog().await;
        }

        let closed = self.router.events_tx.send(SessionEvent::Closed(reason));
        if tokio::time::timeout(Duration::from_secs(1), closed).await.is_err() {
            debug!("{}: owner not reading events", session_id);
        }
        self.cancel.cancel();
        self.link.close().await;
    }

    async fn read_loop(&mut self, session_id: SessionId) -> CloseReason {
        loop {
            let reading = self.router.backlog_bytes < self.backlog_limit;
            let gap_deadline = self.inbound.next_deadline();
            let has_backlog = !self.router.backlog.is_empty() && !self.router.sink_closed;
            let sink = self.router.data_tx.clone();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return CloseReason::Shutdown,

                permit = sink.reserve(), if has_backlog => match permit {
                    Ok(permit) => {
                        if let Some(item) = self.router.backlog.pop_front() {
                            self.router.backlog_bytes -= item.len();
                            permit.send(item);
                        }
                        if !reading {
                            // Peer frames cannot be observed while reads are paused
                            self.liveness.touch(Instant::now());
                        }
                    }
                    Err(_) => {
                        debug!("{}: data sink closed, discarding inbound data", session_id);
                        self.router.sink_closed = true;
                        self.router.backlog.clear();
                        self.router.backlog_bytes = 0;
                    }
                },

                _ = sleep_until(self.liveness.deadline()), if reading => {
                    return CloseReason::KeepaliveTimeout;
                }

                _ = sleep_until(gap_deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE)),
                    if gap_deadline.is_some() =>
                {
                    let events = self.inbound.poll_timers(Instant::now());
                    self.router.route(session_id, events).await;
                }

                message = self.link.recv(), if reading => {
                    let Some(message) = message else {
                        return CloseReason::LinkClosed;
                    };
                    let now = Instant::now();
                    self.liveness.touch(now);
                    match self.inbound.receive(&message, now) {
                        Ok(events) => self.router.route(session_id, events).await,
                        Err(e) => {
                            warn!("{}: {}", session_id, e);
                            return CloseReason::MalformedStorm;
                        }
                    }
                }
            }
        }
    }

    async fn flush_backlog(&mut self) {
        while let Some(item) = self.router.backlog.pop_front() {
            if self.router.sink_closed {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.router.data_tx.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        self.router.backlog.clear();
        self.router.backlog_bytes = 0;
    }
}
