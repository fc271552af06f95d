//! Session multiplexer
//!
//! `Outbound` turns stream data and control events into encoded frames,
//! numbering each frame type independently. `Inbound` decodes messages,
//! restores per-stream order, drops duplicate control frames and holds the
//! exit status back until the output it accounts for has been delivered.

use bytes::Bytes;
use msh_protocol::{
    Control, DegradedNotice, ExitReport, Frame, FrameCodec, FrameType, RemoteStatus, StreamKind,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::liveness::MalformedCounter;
use super::reorder::{LostRange, ReorderBuffer};
use crate::config::SessionConfig;
use crate::error::{MshError, SessionError};

const STREAMS: [StreamKind; 3] = [StreamKind::Stdin, StreamKind::Stdout, StreamKind::Stderr];

fn stream_index(stream: StreamKind) -> usize {
    match stream {
        StreamKind::Stdin => 0,
        StreamKind::Stdout => 1,
        StreamKind::Stderr => 2,
    }
}

fn notice(stream: StreamKind, range: LostRange) -> DegradedNotice {
    DegradedNotice::Lost {
        stream,
        first_lost: range.first,
        last_lost: range.last,
    }
}

/// Outbound half: sequencing, chunking and encoding
#[derive(Debug)]
pub struct Outbound {
    codec: FrameCodec,
    next_seq: HashMap<FrameType, u32>,
    exit_sent: bool,
}

impl Outbound {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            next_seq: HashMap::new(),
            exit_sent: false,
        }
    }

    fn take_seq(&mut self, frame_type: FrameType) -> u32 {
        let seq = self.next_seq.entry(frame_type).or_insert(0);
        let current = *seq;
        *seq = seq.wrapping_add(1);
        current
    }

    /// Frames of a type emitted so far
    pub fn sent_count(&self, frame_type: FrameType) -> u32 {
        self.next_seq.get(&frame_type).copied().unwrap_or(0)
    }

    pub fn exit_sent(&self) -> bool {
        self.exit_sent
    }

    /// Split stream data into encoded frames of at most `max_payload` bytes
    pub fn data_frames(&mut self, stream: StreamKind, data: &[u8]) -> Result<Vec<Bytes>, MshError> {
        if self.exit_sent {
            return Err(SessionError::ExitAlreadySent.into());
        }

        let max = self.codec.max_payload();
        let mut frames = Vec::with_capacity(data.len().div_ceil(max));
        for chunk in data.chunks(max) {
            let seq = self.take_seq(stream.frame_type());
            let frame = Frame::data(stream, seq, Bytes::copy_from_slice(chunk));
            frames.push(self.codec.encode(&frame)?);
        }
        Ok(frames)
    }

    /// Encode a control frame
    ///
    /// Exit reports must go through [`Outbound::exit_frame`] so the frame
    /// counts are filled in.
    pub fn control_frame(&mut self, control: &Control) -> Result<Bytes, MshError> {
        if let Control::Exit(report) = control {
            return self.exit_frame(report.status.clone());
        }
        let mut control = control.clone();
        control.fit_payload(self.codec.max_payload());
        let seq = self.take_seq(control.frame_type());
        let frame = Frame::control(&control, seq)?;
        Ok(self.codec.encode(&frame)?)
    }

    /// Encode the single exit frame for this session
    pub fn exit_frame(&mut self, status: RemoteStatus) -> Result<Bytes, MshError> {
        if self.exit_sent {
            return Err(SessionError::ExitAlreadySent.into());
        }

        let report = ExitReport {
            status,
            stdout_frames: self.sent_count(FrameType::StdoutData),
            stderr_frames: self.sent_count(FrameType::StderrData),
        };
        let mut control = Control::Exit(report);
        control.fit_payload(self.codec.max_payload());
        let seq = self.take_seq(FrameType::ExitStatus);
        let frame = Frame::control(&control, seq)?;
        let encoded = self.codec.encode(&frame)?;
        self.exit_sent = true;
        Ok(encoded)
    }
}

/// Something the inbound half wants its owner to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// In-order stream bytes
    Data(StreamKind, Bytes),
    /// A control event from the peer (never `Exit` or `Keepalive`)
    Control(Control),
    /// The peer's exit report, after the output it covers
    Exit(ExitReport),
    /// Frames were given up on or dropped as malformed
    Degraded(DegradedNotice),
}

#[derive(Debug)]
struct PendingExit {
    report: ExitReport,
    deadline: Instant,
}

/// Inbound half: decoding, reordering and de-duplication
#[derive(Debug)]
pub struct Inbound {
    codec: FrameCodec,
    streams: [ReorderBuffer; 3],
    control_seen: HashMap<FrameType, u32>,
    malformed: MalformedCounter,
    reorder_wait: Duration,
    pending_exit: Option<PendingExit>,
    exited: bool,
}

impl Inbound {
    pub fn new(codec: FrameCodec, config: &SessionConfig) -> Self {
        let window = config.reorder_window;
        Self {
            codec,
            streams: [
                ReorderBuffer::new(window),
                ReorderBuffer::new(window),
                ReorderBuffer::new(window),
            ],
            control_seen: HashMap::new(),
            malformed: MalformedCounter::new(config.malformed_limit, config.malformed_window),
            reorder_wait: config.reorder_wait,
            pending_exit: None,
            exited: false,
        }
    }

    /// Whether the peer's exit has been reported
    pub fn exited(&self) -> bool {
        self.exited
    }

    /// Process one transport message
    ///
    /// A malformed message is dropped and degrades the session; too many
    /// within the malformed window is an error that ends it.
    pub fn receive(&mut self, message: &[u8], now: Instant) -> Result<Vec<InboundEvent>, SessionError> {
        let frame = match self.codec.decode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return self.drop_malformed(now).map(|event| vec![event]);
            }
        };

        let mut events = Vec::new();
        match frame.frame_type.stream() {
            Some(stream) => self.receive_data(stream, frame.seq, frame.payload, now, &mut events),
            None => match frame.to_control() {
                Ok(control) => self.receive_control(control, frame.seq, now, &mut events),
                Err(e) => {
                    warn!("Dropping malformed {} frame: {}", frame.frame_type, e);
                    events.push(self.drop_malformed(now)?);
                }
            },
        }
        Ok(events)
    }

    /// Count a dropped frame; the session is degraded, or over once the limit is hit
    fn drop_malformed(&mut self, now: Instant) -> Result<InboundEvent, SessionError> {
        if self.malformed.record(now) {
            return Err(SessionError::MalformedStorm {
                count: self.malformed.count(),
                window: self.malformed.window(),
            });
        }
        let count = u32::try_from(self.malformed.count()).unwrap_or(u32::MAX);
        Ok(InboundEvent::Degraded(DegradedNotice::Malformed { count }))
    }

    fn receive_data(
        &mut self,
        stream: StreamKind,
        seq: u32,
        payload: Bytes,
        now: Instant,
        events: &mut Vec<InboundEvent>,
    ) {
        if self.exited {
            trace!("Discarding {} frame {} after exit", stream, seq);
            return;
        }
        if let Some(pending) = &self.pending_exit {
            if seq >= Self::exit_count(&pending.report, stream) {
                debug!("Discarding {} frame {} beyond exit report", stream, seq);
                return;
            }
        }

        let out = self.streams[stream_index(stream)].push(seq, payload, now);
        if out.duplicate {
            trace!("Dropping duplicate {} frame {}", stream, seq);
        }
        if let Some(range) = out.lost {
            events.push(InboundEvent::Degraded(notice(stream, range)));
        }
        events.extend(
            out.delivered
                .into_iter()
                .map(|payload| InboundEvent::Data(stream, payload)),
        );

        self.try_finish_exit(events);
    }

    fn receive_control(
        &mut self,
        control: Control,
        seq: u32,
        now: Instant,
        events: &mut Vec<InboundEvent>,
    ) {
        let frame_type = control.frame_type();
        if let Some(&highest) = self.control_seen.get(&frame_type) {
            if seq <= highest {
                trace!("Dropping duplicate {} frame {}", frame_type, seq);
                return;
            }
        }
        self.control_seen.insert(frame_type, seq);

        match control {
            Control::Keepalive => {}
            Control::Exit(report) => {
                if self.exited || self.pending_exit.is_some() {
                    warn!("Ignoring second exit report");
                    return;
                }
                self.pending_exit = Some(PendingExit {
                    report,
                    deadline: now + self.reorder_wait,
                });
                self.try_finish_exit(events);
            }
            other => events.push(InboundEvent::Control(other)),
        }
    }

    fn exit_count(report: &ExitReport, stream: StreamKind) -> u32 {
        match stream {
            StreamKind::Stdout => report.stdout_frames,
            StreamKind::Stderr => report.stderr_frames,
            StreamKind::Stdin => u32::MAX,
        }
    }

    fn try_finish_exit(&mut self, events: &mut Vec<InboundEvent>) {
        let Some(pending) = &self.pending_exit else {
            return;
        };
        let complete = [StreamKind::Stdout, StreamKind::Stderr].iter().all(|&stream| {
            self.streams[stream_index(stream)].next_expected()
                >= Self::exit_count(&pending.report, stream)
        });
        if complete {
            self.finish_exit(events);
        }
    }

    fn finish_exit(&mut self, events: &mut Vec<InboundEvent>) {
        if let Some(pending) = self.pending_exit.take() {
            self.exited = true;
            events.push(InboundEvent::Exit(pending.report));
        }
    }

    /// Earliest time `poll_timers` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.exited {
            return None;
        }
        let gaps = self
            .streams
            .iter()
            .filter_map(|buffer| buffer.deadline(self.reorder_wait));
        let exit = self.pending_exit.as_ref().map(|p| p.deadline);
        gaps.chain(exit).min()
    }

    /// Expire sequence gaps and overdue exit reports
    pub fn poll_timers(&mut self, now: Instant) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        if self.exited {
            return events;
        }

        for stream in STREAMS {
            if let Some((range, delivered)) =
                self.streams[stream_index(stream)].expire(now, self.reorder_wait)
            {
                events.push(InboundEvent::Degraded(notice(stream, range)));
                events.extend(
                    delivered
                        .into_iter()
                        .map(|payload| InboundEvent::Data(stream, payload)),
                );
            }
        }

        let overdue = self
            .pending_exit
            .as_ref()
            .filter(|p| now >= p.deadline)
            .map(|p| p.report.clone());

        match overdue {
            Some(report) => {
                for stream in [StreamKind::Stdout, StreamKind::Stderr] {
                    let end = Self::exit_count(&report, stream);
                    let (lost, delivered) = self.streams[stream_index(stream)].skip_to(end);
                    if let Some(range) = lost {
                        events.push(InboundEvent::Degraded(notice(stream, range)));
                    }
                    events.extend(
                        delivered
                            .into_iter()
                            .map(|payload| InboundEvent::Data(stream, payload)),
                    );
                }
                self.finish_exit(&mut events);
            }
            None => self.try_finish_exit(&mut events),
        }

        events
    }
}
