//! Per-stream reorder buffer
//!
//! Frames of one data stream carry consecutive sequence numbers starting at
//! zero. The buffer hands payloads out strictly in sequence order, drops
//! duplicates and gives up on a gap once it has been open for the reorder
//! wait or the buffer is full.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Inclusive range of sequence numbers declared lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostRange {
    pub first: u32,
    pub last: u32,
}

/// Result of feeding a frame into the buffer
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reordered {
    /// Payloads now deliverable, in order
    pub delivered: Vec<Bytes>,
    /// Range skipped because the buffer overflowed
    pub lost: Option<LostRange>,
    /// The frame was already seen
    pub duplicate: bool,
}

#[derive(Debug)]
pub struct ReorderBuffer {
    next: u32,
    pending: BTreeMap<u32, Bytes>,
    window: usize,
    gap_since: Option<Instant>,
}

impl ReorderBuffer {
    pub fn new(window: usize) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            window: window.max(1),
            gap_since: None,
        }
    }

    /// Sequence number expected next
    pub fn next_expected(&self) -> u32 {
        self.next
    }

    /// Number of out-of-order frames held
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept a frame
    pub fn push(&mut self, seq: u32, payload: Bytes, now: Instant) -> Reordered {
        let mut out = Reordered::default();

        if seq < self.next || self.pending.contains_key(&seq) {
            out.duplicate = true;
            return out;
        }

        if seq == self.next {
            out.delivered.push(payload);
            self.next = self.next.wrapping_add(1);
            self.drain(&mut out.delivered);
        } else {
            self.pending.insert(seq, payload);
            if self.pending.len() > self.window {
                out.lost = self.skip_gap(&mut out.delivered);
            }
        }

        self.update_gap(now);
        out
    }

    /// When the open gap, if any, expires
    pub fn deadline(&self, wait: Duration) -> Option<Instant> {
        self.gap_since.map(|since| since + wait)
    }

    /// Give up on a gap that has been open for `wait`
    pub fn expire(&mut self, now: Instant, wait: Duration) -> Option<(LostRange, Vec<Bytes>)> {
        let deadline = self.deadline(wait)?;
        if now < deadline {
            return None;
        }

        let mut delivered = Vec::new();
        let lost = self.skip_gap(&mut delivered)?;
        self.update_gap(now);
        Some((lost, delivered))
    }

    /// Declare everything before `end` lost, returning the skipped range and
    /// any buffered payloads up to `end`
    pub fn skip_to(&mut self, end: u32) -> (Option<LostRange>, Vec<Bytes>) {
        let mut delivered = Vec::new();
        let mut lost: Option<LostRange> = None;

        while self.next < end {
            if let Some(payload) = self.pending.remove(&self.next) {
                delivered.push(payload);
            } else {
                match &mut lost {
                    Some(range) => range.last = self.next,
                    None => {
                        lost = Some(LostRange {
                            first: self.next,
                            last: self.next,
                        })
                    }
                }
            }
            self.next += 1;
        }

        self.pending.retain(|seq, _| *seq >= end);
        self.gap_since = None;
        (lost, delivered)
    }

    fn drain(&mut self, delivered: &mut Vec<Bytes>) {
        while let Some(payload) = self.pending.remove(&self.next) {
            delivered.push(payload);
            self.next = self.next.wrapping_add(1);
        }
    }

    fn skip_gap(&mut self, delivered: &mut Vec<Bytes>) -> Option<LostRange> {
        let (&lowest, _) = self.pending.iter().next()?;
        let lost = LostRange {
            first: self.next,
            last: lowest - 1,
        };
        self.next = lowest;
        self.drain(delivered);
        Some(lost)
    }

    fn update_gap(&mut self, now: Instant) {
        if self.pending.is_empty() {
            self.gap_since = None;
        } else if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buf = ReorderBuffer::new(8);
        let now = Instant::now();
        assert_eq!(buf.push(0, b("a"), now).delivered, vec![b("a")]);
        assert_eq!(buf.push(1, b("b"), now).delivered, vec![b("b")]);
        assert_eq!(buf.next_expected(), 2);
    }

    #[test]
    fn test_out_of_order_is_reassembled() {
        let mut buf = ReorderBuffer::new(8);
        let now = Instant::now();

        assert!(buf.push(2, b("c"), now).delivered.is_empty());
        assert!(buf.push(1, b("b"), now).delivered.is_empty());
        assert_eq!(buf.deadline(Duration::from_secs(1)), Some(now + Duration::from_secs(1)));

        let out = buf.push(0, b("a"), now);
        assert_eq!(out.delivered, vec![b("a"), b("b"), b("c")]);
        assert_eq!(buf.deadline(Duration::from_secs(1)), None);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut buf = ReorderBuffer::new(8);
        let now = Instant::now();
        buf.push(0, b("a"), now);
        buf.push(2, b("c"), now);

        assert!(buf.push(0, b("a"), now).duplicate);
        assert!(buf.push(2, b("c"), now).duplicate);
        assert_eq!(buf.pending(), 1);
    }

    #[test]
    fn test_gap_expires() {
        let mut buf = ReorderBuffer::new(8);
        let start = Instant::now();
        let wait = Duration::from_millis(100);

        buf.push(0, b("a"), start);
        buf.push(3, b("d"), start);
        buf.push(4, b("e"), start);

        assert!(buf.expire(start + Duration::from_millis(50), wait).is_none());

        let (lost, delivered) = buf.expire(start + wait, wait).unwrap();
        assert_eq!(lost, LostRange { first: 1, last: 2 });
        assert_eq!(delivered, vec![b("d"), b("e")]);
        assert_eq!(buf.next_expected(), 5);

        // A straggler from the lost range is now a duplicate
        assert!(buf.push(1, b("b"), start + wait).duplicate);
    }

    #[test]
    fn test_overflow_skips_gap() {
        let mut buf = ReorderBuffer::new(2);
        let now = Instant::now();

        buf.push(1, b("b"), now);
        buf.push(2, b("c"), now);
        let out = buf.push(3, b("d"), now);

        assert_eq!(out.lost, Some(LostRange { first: 0, last: 0 }));
        assert_eq!(out.delivered, vec![b("b"), b("c"), b("d")]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_skip_to_flushes_and_reports_loss() {
        let mut buf = ReorderBuffer::new(8);
        let now = Instant::now();

        buf.push(0, b("a"), now);
        buf.push(2, b("c"), now);
        buf.push(5, b("f"), now);

        let (lost, delivered) = buf.skip_to(4);
        assert_eq!(lost, Some(LostRange { first: 1, last: 3 }));
        assert_eq!(delivered, vec![b("c")]);
        assert_eq!(buf.next_expected(), 4);
        assert_eq!(buf.pending(), 1);
    }
}
