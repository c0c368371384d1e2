//! Selective-Repeat data phase.
//!
//! Both loops live on [`Connection`] next to their Stop-and-Wait siblings.
//!
//! ## Sender
//! ```text
//! loop {
//!     fill window from the file while there is room
//!     resend every record whose own deadline has passed
//!     wait for an ACK until the earliest remaining deadline
//! }
//! ```
//! Expired records are collected before every wait.  A steady stream of
//! ACKs therefore cannot starve retransmission of an older lost packet.
//!
//! ## Receiver
//! Every in-window DATA is acknowledged individually and buffered; the
//! contiguous prefix is written as soon as it exists.  CLOSE ends the loop
//! unacknowledged; see [`Connection::acknowledge_close`].

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::connection::{read_chunk, Connection, TransferError, FIRST_DATA_SEQ};
use crate::packet::{wire_seq, Kind, Packet};
use crate::socket::Channel;
use crate::sr_receiver::{Placement, ReceiveWindow};
use crate::sr_sender::{AckOutcome, SendWindow};
use crate::timer::IdleWatch;

impl<C: Channel> Connection<C> {
    /// Selective-Repeat sender.  Returns the sequence number for CLOSE.
    pub async fn send_selective_repeat<R>(&mut self, reader: &mut R) -> Result<u32, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let timeout = self.config.sr_sender_timeout;
        let mut window = SendWindow::new(FIRST_DATA_SEQ, self.config.window_size);
        let mut idle = IdleWatch::new(self.config.idle_timeout);
        let mut eof = false;

        while !eof || !window.is_empty() {
            if !eof && window.can_send() {
                let chunk = read_chunk(reader).await?;
                if chunk.is_empty() {
                    eof = true;
                    continue;
                }
                self.stats.bytes += chunk.len() as u64;
                let pkt = Packet::data(wire_seq(window.next_seq)?, chunk);
                self.transmit(&pkt).await?;
                window.push(pkt, Instant::now() + timeout);
                continue;
            }

            for pkt in window.take_due(Instant::now(), timeout) {
                self.retransmit(&pkt).await?;
            }

            let deadline = window
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + timeout);
            match self.recv_from_peer(deadline).await? {
                Some(reply) if reply.kind == Kind::Ack => {
                    idle.heard();
                    self.trace("←", &reply);
                    match window.on_ack(reply.seq) {
                        AckOutcome::Slid(n) => {
                            log::trace!("[{}] window slid by {n} to base {}", self.peer, window.base);
                        }
                        AckOutcome::Marked => {}
                        AckOutcome::Duplicate | AckOutcome::Ignored => self.stats.duplicates += 1,
                    }
                }
                Some(_) => idle.heard(),
                None if idle.expired() => return Err(TransferError::PeerSilent(idle.limit())),
                None => {}
            }
        }
        Ok(window.next_seq)
    }

    /// Selective-Repeat receiver.  Returns the sequence carried by CLOSE,
    /// which is left unacknowledged.
    pub async fn receive_selective_repeat<W>(
        &mut self,
        writer: &mut W,
        first: Option<Packet>,
    ) -> Result<u16, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let timeout = self.config.sr_receiver_timeout;
        let mut window = ReceiveWindow::new(FIRST_DATA_SEQ, self.config.window_size);
        let mut idle = IdleWatch::new(self.config.idle_timeout);
        let mut pending = first;

        loop {
            let packet = match pending.take() {
                Some(p) => p,
                None => match self.recv_from_peer(Instant::now() + timeout).await? {
                    Some(p) => {
                        idle.heard();
                        p
                    }
                    None if idle.expired() => return Err(TransferError::PeerSilent(idle.limit())),
                    None => continue,
                },
            };
            self.trace("←", &packet);

            let Packet { kind, seq, payload } = packet;
            match kind {
                Kind::Data => match window.on_data(seq, payload) {
                    Placement::Duplicate => {
                        self.stats.duplicates += 1;
                        self.transmit(&Packet::ack(seq)).await?;
                    }
                    Placement::Stored => {
                        self.transmit(&Packet::ack(seq)).await?;
                        let ready = window.drain_ready();
                        if ready.is_empty() {
                            continue;
                        }
                        for chunk in ready {
                            writer.write_all(&chunk).await?;
                            self.stats.bytes += chunk.len() as u64;
                        }
                        writer.flush().await?;
                    }
                    Placement::AheadOfWindow => {
                        self.stats.duplicates += 1;
                        log::debug!(
                            "[{}] DATA#{seq} beyond window [{}, +{}); dropped",
                            self.peer,
                            window.base,
                            window.window_size()
                        );
                    }
                },
                Kind::Close => return Ok(seq),
                _ => {}
            }
        }
    }
}
