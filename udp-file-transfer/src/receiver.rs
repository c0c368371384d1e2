//! Inbound state for stop-and-wait reliability.
//!
//! The [`Receiver`] decides, for each DATA packet, whether its payload is the
//! next one owed to the output file.  It does **not** write or send ACKs
//! itself; it tells [`crate::connection::Connection`] what to do:
//! - In-order DATA: append the payload and ACK its sequence.
//! - Anything else: re-ACK the last accepted sequence so the sender learns
//!   what is still missing, and write nothing.

/// Verdict on one DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Payload is next in order: write it, then ACK this sequence.
    Accept(u16),
    /// Duplicate or out of order: ACK this (last accepted) sequence instead.
    Reack(u16),
}

/// Stop-and-wait receive-side state for one transfer.
#[derive(Debug)]
pub struct Receiver {
    /// Next sequence number owed to the file.
    pub expected: u32,
}

impl Receiver {
    /// `first_seq` is the sequence of the first DATA packet; the sequence
    /// just below it (the handshake class) doubles as "nothing accepted yet".
    pub fn new(first_seq: u32) -> Self {
        Self { expected: first_seq }
    }

    /// Classify a DATA packet carrying `seq`.  Advances `expected` on accept.
    pub fn on_data(&mut self, seq: u16) -> Verdict {
        if u32::from(seq) == self.expected {
            self.expected += 1;
            Verdict::Accept(seq)
        } else {
            Verdict::Reack(self.last_accepted())
        }
    }

    /// Sequence of the most recently accepted DATA.
    pub fn last_accepted(&self) -> u16 {
        // `expected` only advances past sequences that came off the wire, so
        // the value below it always fits.
        u16::try_from(self.expected.saturating_sub(1)).unwrap_or(u16::MAX)
    }
}
