//! Selective-Repeat send-side window.
//!
//! [`SendWindow`] keeps up to `window_size` DATA packets in flight, each with
//! its own retransmission deadline.  Unlike Go-Back-N, ACKs are
//! **individual**: `ACK(n)` confirms packet `n` alone, and a timeout resends
//! only the packets whose own deadline has passed.
//!
//! # Sequence-number layout
//!
//! ```text
//!   base                      next_seq          base + window_size
//!    │                           │                     │
//!  ──┼───────────────────────────┼─────────────────────┼──▶ seq space
//!    │ <── in flight (records) ─▶│ <──── sendable ────▶│
//! ```
//!
//! Record `i` in the deque always carries sequence `base + i`, so lookups
//! are `O(1)` and sliding costs the length of the acknowledged run.
//!
//! This module only manages state; all socket I/O is the caller's job.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::packet::Packet;

/// One in-flight DATA packet.
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub packet: Packet,
    /// When this packet is due for retransmission.
    pub deadline: Instant,
    pub acked: bool,
}

/// What an inbound ACK did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Outside `[base, next_seq)`: stale or bogus.
    Ignored,
    /// The record was already acknowledged.
    Duplicate,
    /// Record marked; `base` unchanged because an earlier record is pending.
    Marked,
    /// `base` advanced by this many records.
    Slid(usize),
}

/// Selective-Repeat send-side state for one transfer.
#[derive(Debug)]
pub struct SendWindow {
    /// Lowest unacknowledged sequence number (left window edge).
    pub base: u32,
    /// Sequence number for the **next** new packet.
    pub next_seq: u32,
    window_size: usize,
    records: VecDeque<SendRecord>,
}

impl SendWindow {
    /// `first_seq` is the first DATA sequence; `window_size` is clamped to at
    /// least one.
    pub fn new(first_seq: u32, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            base: first_seq,
            next_seq: first_seq,
            window_size,
            records: VecDeque::with_capacity(window_size),
        }
    }

    /// `true` while `next_seq < base + window_size`.
    pub fn can_send(&self) -> bool {
        self.records.len() < self.window_size
    }

    /// Records sent but not yet evicted (`next_seq - base`).
    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    /// `true` when every sent packet has been acknowledged and evicted.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Place a just-transmitted packet at the right edge of the window.
    ///
    /// The packet must carry `next_seq`; check [`can_send`](Self::can_send)
    /// first.
    pub fn push(&mut self, packet: Packet, deadline: Instant) {
        debug_assert!(
            self.can_send(),
            "push on a full window ({} / {})",
            self.records.len(),
            self.window_size
        );
        debug_assert_eq!(u32::from(packet.seq), self.next_seq);
        self.records.push_back(SendRecord {
            packet,
            deadline,
            acked: false,
        });
        self.next_seq += 1;
    }

    /// Process an individual ACK.
    ///
    /// Marks the record for `ack_seq`; when it is the base record, evicts the
    /// whole acknowledged prefix and advances `base` past it.
    pub fn on_ack(&mut self, ack_seq: u16) -> AckOutcome {
        let n = u32::from(ack_seq);
        if n < self.base || n >= self.next_seq {
            return AckOutcome::Ignored;
        }
        let idx = (n - self.base) as usize;
        let Some(record) = self.records.get_mut(idx) else {
            return AckOutcome::Ignored;
        };
        if record.acked {
            return AckOutcome::Duplicate;
        }
        record.acked = true;
        if idx != 0 {
            return AckOutcome::Marked;
        }

        let mut slid = 0usize;
        while self.records.front().is_some_and(|r| r.acked) {
            self.records.pop_front();
            self.base += 1;
            slid += 1;
        }
        AckOutcome::Slid(slid)
    }

    /// Collect every unacknowledged packet whose deadline is at or before
    /// `now`, pushing each deadline to `now + timeout`.  Acknowledged records
    /// are never returned.
    pub fn take_due(&mut self, now: Instant, timeout: Duration) -> Vec<Packet> {
        self.records
            .iter_mut()
            .filter(|r| !r.acked && r.deadline <= now)
            .map(|r| {
                r.deadline = now + timeout;
                r.packet.clone()
            })
            .collect()
    }

    /// Earliest deadline among unacknowledged records.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.records
            .iter()
            .filter(|r| !r.acked)
            .map(|r| r.deadline)
            .min()
    }
}
