//! Outbound state for stop-and-wait reliability.
//!
//! [`Sender`] tracks the sequence number and the single in-flight DATA
//! packet.  It does **not** touch the socket;
//! [`crate::connection::Connection`] calls these methods and owns the actual
//! send/receive loop.
//!
//! # Stop-and-Wait contract
//! - At most **one** packet is in flight at any moment (`unacked`).
//! - A new packet may only be built once `unacked` is `None`.
//! - On the ACK carrying the in-flight sequence: advance `next_seq` by one
//!   and clear `unacked`.
//! - On timeout or any other ACK: resend the same packet unchanged.

use crate::packet::{wire_seq, Packet, PacketError};

/// Stop-and-wait send-side state for one transfer.
#[derive(Debug)]
pub struct Sender {
    /// Sequence number of the **next** DATA to build.  Remains unchanged
    /// while a packet is in flight.
    pub next_seq: u32,

    /// The in-flight packet, or `None` when the sender is idle.
    pub unacked: Option<Packet>,
}

impl Sender {
    /// `first_seq` is the sequence of the first DATA packet.
    pub fn new(first_seq: u32) -> Self {
        Self {
            next_seq: first_seq,
            unacked: None,
        }
    }

    /// Build the DATA packet for `payload` at `next_seq`.
    ///
    /// Fails once the sequence space of the wire field is used up.
    pub fn build_data_packet(&self, payload: Vec<u8>) -> Result<Packet, PacketError> {
        Ok(Packet::data(wire_seq(self.next_seq)?, payload))
    }

    /// Move `packet` into the in-flight slot (first transmission).
    pub fn record_sent(&mut self, packet: Packet) {
        debug_assert!(
            self.unacked.is_none(),
            "record_sent called while a packet is already in flight"
        );
        self.unacked = Some(packet);
    }

    /// Process an inbound ACK.
    ///
    /// Returns `true` if it acknowledges the in-flight packet; `false` for a
    /// duplicate or unexpected ACK, which the caller answers by resending.
    pub fn on_ack(&mut self, ack_seq: u16) -> bool {
        match self.unacked {
            Some(ref packet) if packet.seq == ack_seq => {
                self.next_seq += 1;
                self.unacked = None;
                true
            }
            _ => false,
        }
    }

    /// The in-flight packet, if any.
    pub fn in_flight(&self) -> Option<&Packet> {
        self.unacked.as_ref()
    }

    pub fn has_unacked(&self) -> bool {
        self.unacked.is_some()
    }
}
