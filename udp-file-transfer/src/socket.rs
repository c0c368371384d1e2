//! Async UDP channel abstraction.
//!
//! [`Channel`] is the seam every protocol layer talks through: send one
//! [`Packet`] to an address, or wait for the next one until a deadline.
//! [`Socket`] is the production implementation, a thin wrapper around
//! `tokio::net::UdpSocket`; [`crate::simulator::Simulator`] wraps any
//! channel with fault injection for tests.  All protocol logic lives
//! elsewhere; this module owns only byte I/O and receive deadlines.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::packet::{Packet, PacketError, MAX_PACKET};

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The datagram could not be framed as a valid packet.
    #[error("packet framing error: {0}")]
    Packet(#[from] PacketError),
}

/// Outcome of a deadline-bounded receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Packet(Packet, SocketAddr),
    /// The deadline passed with no well-formed packet.
    TimedOut,
}

/// A datagram endpoint that speaks [`Packet`]s.
///
/// Methods take `&self` so one channel can be polled for receive while a
/// send is issued from the same task.
pub trait Channel: Send + Sync {
    /// Address this endpoint is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Encode `packet` and send it as a single datagram to `dest`.
    fn send_to(
        &self,
        packet: &Packet,
        dest: SocketAddr,
    ) -> impl Future<Output = Result<(), SocketError>> + Send;

    /// Receive the next datagram and decode it.  Malformed datagrams are
    /// returned as `Err(SocketError::Packet)`.
    fn recv_from(&self) -> impl Future<Output = Result<(Packet, SocketAddr), SocketError>> + Send;

    /// Wait for the next well-formed packet, giving up at `deadline`.
    ///
    /// Framing errors and transient OS errors are dropped and the wait
    /// continues against the same deadline, so a corrupt datagram never ends
    /// a retry interval early.
    fn recv_until(
        &self,
        deadline: Instant,
    ) -> impl Future<Output = Result<Received, SocketError>> + Send {
        async move {
            loop {
                match tokio::time::timeout_at(deadline, self.recv_from()).await {
                    Err(_elapsed) => return Ok(Received::TimedOut),
                    Ok(Ok((packet, from))) => return Ok(Received::Packet(packet, from)),
                    Ok(Err(SocketError::Packet(e))) => {
                        log::debug!("dropping malformed datagram: {e}");
                    }
                    Ok(Err(SocketError::Io(e))) if is_transient_io_error(&e) => {
                        log::debug!("ignoring transient receive error: {e}");
                    }
                    Ok(Err(e)) => return Err(e),
                }
            }
        }
    }
}

/// Errors a UDP receive can report for reasons unrelated to this endpoint
/// (ICMP unreachable from an earlier send, interrupted syscalls).
fn is_transient_io_error(e: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}

/// A packet-oriented UDP socket.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Send already-encoded bytes.  Used by tests that need to put malformed
    /// datagrams on the wire.
    pub async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }
}

impl Channel for Socket {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = packet.encode()?;
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        // One spare byte so an oversized datagram is detected instead of
        // silently truncated to a valid-looking packet.
        let mut buf = vec![0u8; MAX_PACKET + 1];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let packet = Packet::decode(&buf[..n])?;
        Ok((packet, addr))
    }
}
