//! Per-transfer data phase: Stop-and-Wait loops and teardown.
//!
//! A [`Connection`] owns everything one transfer needs after the handshake:
//! the channel, the peer address, the protocol configuration and running
//! statistics.  Its responsibilities are:
//! - Driving the Stop-and-Wait sender and receiver loops (this module) and
//!   the Selective-Repeat loops ([`crate::sr_connection`]).
//! - Filtering out datagrams from anyone but the peer.
//! - Closing the stream reliably with CLOSE / ACK ([`Connection::close`] on
//!   the sending side, [`Connection::acknowledge_close`] on the receiving
//!   side once the output is durable).
//!
//! State machines ([`crate::sender`], [`crate::receiver`],
//! [`crate::sr_sender`], [`crate::sr_receiver`]) never touch the socket;
//! every send and receive happens here.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::Level;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::config::ProtocolConfig;
use crate::packet::{wire_seq, Kind, Packet, PacketError, MAX_PAYLOAD};
use crate::receiver::{Receiver, Verdict};
use crate::sender::Sender;
use crate::socket::{Channel, Received, SocketError};
use crate::state::ArqMode;
use crate::timer::{IdleWatch, RetryBudget};

/// Sequence number carried by the first DATA packet of every transfer.
/// Sequence 0 belongs to the handshake.
pub const FIRST_DATA_SEQ: u32 = 1;

/// Errors that end an established transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Framing(#[from] PacketError),
    /// Nothing arrived from the peer for the configured idle limit.
    #[error("peer silent for {0:?}; giving up")]
    PeerSilent(Duration),
    /// CLOSE was never acknowledged.  All data is already durable.
    #[error("CLOSE not acknowledged after {attempts} attempts")]
    CloseTimeout { attempts: u32 },
}

/// Counters collected over one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// File bytes sent (sender) or written (receiver).
    pub bytes: u64,
    /// Datagrams put on the wire, retransmissions included.
    pub packets: u64,
    /// Datagrams that were resends of an earlier packet.
    pub retransmissions: u64,
    /// Duplicate, stale or out-of-window packets seen from the peer.
    pub duplicates: u64,
    /// Whether the CLOSE handshake completed (sender side only).
    pub close_confirmed: bool,
    pub elapsed: Duration,
}

/// The data phase of one transfer, bound to a single peer.
pub struct Connection<C> {
    pub(crate) channel: C,
    pub(crate) peer: SocketAddr,
    pub(crate) config: ProtocolConfig,
    pub(crate) verbose: bool,
    pub(crate) stats: TransferStats,
    started: Instant,
}

impl<C: Channel> Connection<C> {
    pub fn new(channel: C, peer: SocketAddr, config: ProtocolConfig, verbose: bool) -> Self {
        Self {
            channel,
            peer,
            config,
            verbose,
            stats: TransferStats::default(),
            started: Instant::now(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Send everything `reader` yields, then close.
    ///
    /// An unacknowledged CLOSE is logged and reported through
    /// [`TransferStats::close_confirmed`]; it does not fail the transfer.
    pub async fn send_stream<R>(
        &mut self,
        mode: ArqMode,
        reader: &mut R,
    ) -> Result<TransferStats, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        log::info!("[{}] sending ({mode})", self.peer);

        let close_seq = match mode {
            ArqMode::StopAndWait => self.send_stop_and_wait(reader).await?,
            ArqMode::SelectiveRepeat => self.send_selective_repeat(reader).await?,
        };
        match self.close(close_seq).await {
            Ok(()) => {}
            Err(TransferError::CloseTimeout { attempts }) => {
                log::warn!(
                    "[{}] CLOSE#{close_seq} not acknowledged after {attempts} attempts; \
                     all data was delivered",
                    self.peer
                );
            }
            Err(e) => return Err(e),
        }

        self.stats.elapsed = self.started.elapsed();
        log::info!(
            "[{}] sent {} bytes in {:?} ({} packets, {} retransmitted)",
            self.peer,
            self.stats.bytes,
            self.stats.elapsed,
            self.stats.packets,
            self.stats.retransmissions
        );
        Ok(self.stats.clone())
    }

    /// Receive the peer's stream into `writer` until CLOSE.
    ///
    /// `first` is a packet already taken off the wire during the handshake;
    /// it is processed before anything else.  Returns the sequence carried
    /// by CLOSE.  The CLOSE is not acknowledged here: the caller makes the
    /// output durable first and then calls [`acknowledge_close`].
    ///
    /// [`acknowledge_close`]: Connection::acknowledge_close
    pub async fn receive_stream<W>(
        &mut self,
        mode: ArqMode,
        writer: &mut W,
        first: Option<Packet>,
    ) -> Result<u16, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        log::info!("[{}] receiving ({mode})", self.peer);

        let close_seq = match mode {
            ArqMode::StopAndWait => self.receive_stop_and_wait(writer, first).await?,
            ArqMode::SelectiveRepeat => self.receive_selective_repeat(writer, first).await?,
        };
        writer.flush().await?;
        log::debug!("[{}] CLOSE#{close_seq} after {} bytes", self.peer, self.stats.bytes);
        Ok(close_seq)
    }

    // -----------------------------------------------------------------------
    // Stop-and-Wait
    // -----------------------------------------------------------------------

    /// Stop-and-Wait sender.  Returns the sequence number for CLOSE.
    pub async fn send_stop_and_wait<R>(&mut self, reader: &mut R) -> Result<u32, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let timeout = self.config.sw_sender_timeout;
        let mut sender = Sender::new(FIRST_DATA_SEQ);
        let mut idle = IdleWatch::new(self.config.idle_timeout);

        loop {
            let chunk = read_chunk(reader).await?;
            if chunk.is_empty() {
                break;
            }
            self.stats.bytes += chunk.len() as u64;
            let pkt = sender.build_data_packet(chunk)?;
            self.transmit(&pkt).await?;
            sender.record_sent(pkt);

            let mut deadline = Instant::now() + timeout;
            while sender.has_unacked() {
                match self.recv_from_peer(deadline).await? {
                    Some(reply) => {
                        idle.heard();
                        if reply.kind != Kind::Ack {
                            continue;
                        }
                        self.trace("←", &reply);
                        if sender.on_ack(reply.seq) {
                            break;
                        }
                        // Any other ACK means the outstanding packet is
                        // still missing on the far side.
                        self.stats.duplicates += 1;
                    }
                    None if idle.expired() => return Err(TransferError::PeerSilent(idle.limit())),
                    None => {}
                }
                if let Some(pkt) = sender.in_flight() {
                    self.retransmit(pkt).await?;
                }
                deadline = Instant::now() + timeout;
            }
        }
        Ok(sender.next_seq)
    }

    /// Stop-and-Wait receiver.  Returns the sequence carried by CLOSE, which
    /// is left unacknowledged.
    pub async fn receive_stop_and_wait<W>(
        &mut self,
        writer: &mut W,
        first: Option<Packet>,
    ) -> Result<u16, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let timeout = self.config.sw_receiver_timeout;
        let mut receiver = Receiver::new(FIRST_DATA_SEQ);
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

            match packet.kind {
                Kind::Data => match receiver.on_data(packet.seq) {
                    Verdict::Accept(seq) => {
                        writer.write_all(&packet.payload).await?;
                        writer.flush().await?;
                        self.stats.bytes += packet.payload.len() as u64;
                        self.transmit(&Packet::ack(seq)).await?;
                    }
                    Verdict::Reack(seq) => {
                        self.stats.duplicates += 1;
                        self.transmit(&Packet::ack(seq)).await?;
                    }
                },
                Kind::Close => return Ok(packet.seq),
                _ => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Send CLOSE(`seq`) until the peer acknowledges it or the retry budget
    /// runs out.
    pub async fn close(&mut self, seq: u32) -> Result<(), TransferError> {
        let close = Packet::close(wire_seq(seq)?);
        let mut budget = RetryBudget::new(self.config.max_tries);

        while budget.try_consume() {
            if budget.used() == 1 {
                self.transmit(&close).await?;
            } else {
                self.retransmit(&close).await?;
            }
            let deadline = Instant::now() + self.config.handshake_timeout;
            while let Some(reply) = self.recv_from_peer(deadline).await? {
                if reply.kind == Kind::Ack && reply.seq == close.seq {
                    self.trace("←", &reply);
                    self.stats.close_confirmed = true;
                    return Ok(());
                }
            }
        }
        Err(TransferError::CloseTimeout {
            attempts: budget.used(),
        })
    }

    /// Acknowledge CLOSE(`seq`) and linger so a lost ACK can be repaired.
    ///
    /// Every repeated CLOSE is answered with the same ACK and extends the
    /// linger.  The linger ends after two handshake timeouts of silence;
    /// anything else from the peer is ignored.
    pub async fn acknowledge_close(&mut self, seq: u16) -> Result<TransferStats, TransferError> {
        let ack = Packet::ack(seq);
        self.transmit(&ack).await?;
        self.stats.elapsed = self.started.elapsed();
        log::info!(
            "[{}] received {} bytes in {:?}",
            self.peer,
            self.stats.bytes,
            self.stats.elapsed
        );

        let linger = self.config.handshake_timeout * 2;
        let mut deadline = Instant::now() + linger;
        while let Some(pkt) = self.recv_from_peer(deadline).await? {
            if pkt.kind == Kind::Close && pkt.seq == seq {
                self.trace("←", &pkt);
                self.stats.duplicates += 1;
                self.retransmit(&ack).await?;
                deadline = Instant::now() + linger;
            }
        }
        Ok(self.stats.clone())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Wait until `deadline` for the next packet from the peer.  Packets from
    /// other addresses are skipped without extending the deadline.
    pub(crate) async fn recv_from_peer(
        &self,
        deadline: Instant,
    ) -> Result<Option<Packet>, TransferError> {
        loop {
            match self.channel.recv_until(deadline).await? {
                Received::TimedOut => return Ok(None),
                Received::Packet(pkt, from) if from == self.peer => return Ok(Some(pkt)),
                Received::Packet(pkt, from) => {
                    log::debug!("[{}] ignoring {pkt} from {from}", self.peer);
                }
            }
        }
    }

    pub(crate) async fn transmit(&mut self, pkt: &Packet) -> Result<(), TransferError> {
        self.channel.send_to(pkt, self.peer).await?;
        self.stats.packets += 1;
        self.trace("→", pkt);
        Ok(())
    }

    pub(crate) async fn retransmit(&mut self, pkt: &Packet) -> Result<(), TransferError> {
        self.stats.retransmissions += 1;
        self.channel.send_to(pkt, self.peer).await?;
        self.stats.packets += 1;
        self.trace("↻", pkt);
        Ok(())
    }

    /// Per-packet log line; promoted to `debug` for verbose transfers.
    pub(crate) fn trace(&self, arrow: &str, pkt: &Packet) {
        let level = if self.verbose { Level::Debug } else { Level::Trace };
        log::log!(level, "[{}] {arrow} {pkt}", self.peer);
    }
}

/// Read up to one full payload from `reader`.  An empty result means EOF.
pub(crate) async fn read_chunk<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_PAYLOAD];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
