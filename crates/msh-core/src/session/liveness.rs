//! Link liveness and malformed-frame accounting

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks when the peer was last heard from
#[derive(Debug)]
pub struct Liveness {
    last_heard: Instant,
    timeout: Duration,
}

impl Liveness {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            last_heard: now,
            timeout,
        }
    }

    /// Record inbound traffic
    pub fn touch(&mut self, now: Instant) {
        self.last_heard = now;
    }

    /// When the link will be declared dead without further traffic
    pub fn deadline(&self) -> Instant {
        self.last_heard + self.timeout
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Counts malformed frames in a sliding window
#[derive(Debug)]
pub struct MalformedCounter {
    seen: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl MalformedCounter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            seen: VecDeque::with_capacity(limit),
            limit,
            window,
        }
    }

    /// Record a malformed frame; returns true once the limit is reached
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.seen.front() {
            if now.duration_since(oldest) >= self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
        self.seen.push_back(now);
        self.seen.len() >= self.limit
    }

    /// Malformed frames within the current window
    pub fn count(&self) -> usize {
        self.seen.len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
