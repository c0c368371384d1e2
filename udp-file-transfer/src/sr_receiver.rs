//! Selective-Repeat receive-side window.
//!
//! [`ReceiveWindow`] buffers DATA that arrives ahead of the next sequence
//! owed to the file and releases it strictly in order:
//!
//! - `seq < base`: already delivered; the sender lost our ACK, re-ACK it.
//! - `base ≤ seq < base + window_size`: ACK individually and store in the
//!   slot for `seq`; release the filled prefix starting at `base`.
//! - beyond the window: a correct sender never gets this far ahead; drop.
//!
//! Slot `i` always holds sequence `base + i`.  This module only manages
//! state; writing and ACKing are the caller's job.

use std::collections::VecDeque;

/// Classification of one DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Left of the window: re-ACK and discard.
    Duplicate,
    /// Inside the window: ACK, and drain [`ReceiveWindow::drain_ready`].
    Stored,
    /// Right of the window: drop without ACK.
    AheadOfWindow,
}

/// Selective-Repeat receive-side state for one transfer.
#[derive(Debug)]
pub struct ReceiveWindow {
    /// Lowest sequence not yet delivered to the output.
    pub base: u32,
    slots: VecDeque<Option<Vec<u8>>>,
}

impl ReceiveWindow {
    pub fn new(first_seq: u32, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            base: first_seq,
            slots: std::iter::repeat_with(|| None).take(window_size).collect(),
        }
    }

    pub fn window_size(&self) -> usize {
        self.slots.len()
    }

    /// Place the payload of DATA(`seq`).  A repeat of a buffered packet
    /// overwrites its slot with identical bytes.
    pub fn on_data(&mut self, seq: u16, payload: Vec<u8>) -> Placement {
        let n = u32::from(seq);
        if n < self.base {
            return Placement::Duplicate;
        }
        let idx = (n - self.base) as usize;
        match self.slots.get_mut(idx) {
            Some(slot) => {
                *slot = Some(payload);
                Placement::Stored
            }
            None => Placement::AheadOfWindow,
        }
    }

    /// Pop the contiguous run of filled slots starting at `base`, in order,
    /// sliding the window forward by the number popped.
    pub fn drain_ready(&mut self) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        while let Some(Some(_)) = self.slots.front() {
            if let Some(Some(chunk)) = self.slots.pop_front() {
                ready.push(chunk);
            }
            self.slots.push_back(None);
            self.base += 1;
        }
        ready
    }
}
