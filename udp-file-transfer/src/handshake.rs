//! Connection establishment.
//!
//! The client sends REQ(kind, 0, name) to the rendezvous address.  The
//! server answers from a fresh per-transfer port, and every later datagram
//! goes to that port.
//!
//! ```text
//!            client                                   worker
//! UPLOAD     REQ(UPLOAD, name)  ───────────────▶
//!                               ◀───────────────  ACK(0)       (repeated)
//!            DATA / CLOSE       ───────────────▶  established
//!
//! DOWNLOAD   REQ(DOWNLOAD, name) ──────────────▶  established
//!                               ◀───────────────  DATA / CLOSE (first data)
//!
//! rejected   REQ(…)             ───────────────▶
//!                               ◀───────────────  ERROR(msg)   (repeated)
//!            ACK(0)             ───────────────▶
//! ```
//!
//! Whichever packet completes the handshake for the receiving side (the
//! client's first DATA on upload, the worker's first DATA on download) is
//! handed to the data phase in [`Established::first`] so it is not lost.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::ProtocolConfig;
use crate::packet::{Kind, Packet, PacketError, MAX_PAYLOAD};
use crate::socket::{Channel, Received, SocketError};
use crate::state::{Direction, HandshakeState};
use crate::timer::RetryBudget;

#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The server answered with ERROR; carries its message.
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("no usable response after {attempts} attempts")]
    TimedOut { attempts: u32 },
    #[error("invalid file name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl From<PacketError> for HandshakeError {
    fn from(e: PacketError) -> Self {
        HandshakeError::Socket(SocketError::Packet(e))
    }
}

/// A validated transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub direction: Direction,
    pub file_name: String,
}

impl Request {
    pub fn new(direction: Direction, file_name: &str) -> Result<Self, HandshakeError> {
        check_file_name(file_name).map_err(|reason| HandshakeError::InvalidName {
            name: file_name.to_string(),
            reason,
        })?;
        Ok(Self {
            direction,
            file_name: file_name.to_string(),
        })
    }

    /// Parse a REQ datagram.  `None` when the packet is not a request.
    pub fn from_packet(packet: &Packet) -> Option<Result<Self, HandshakeError>> {
        let direction = Direction::from_kind(packet.kind)?;
        Some(match std::str::from_utf8(&packet.payload) {
            Ok(name) => Request::new(direction, name),
            Err(_) => Err(HandshakeError::InvalidName {
                name: packet.text(),
                reason: "not valid UTF-8",
            }),
        })
    }

    pub fn packet(&self) -> Packet {
        Packet::request(self.direction.request_kind(), &self.file_name)
    }
}

/// A file name must name a single entry inside the storage directory.
pub fn check_file_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty");
    }
    if name.len() > MAX_PAYLOAD {
        return Err("too long");
    }
    if name == "." || name == ".." {
        return Err("not a file");
    }
    if name.contains(['/', '\\', '\0']) {
        return Err("must not contain path separators");
    }
    Ok(())
}

/// The server's decision on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Reject(String),
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Established {
    /// Address every later datagram of this transfer goes to.
    pub peer: SocketAddr,
    /// First data-phase packet, already taken off the wire.
    pub first: Option<Packet>,
}

/// Handshake driver for one endpoint.
pub struct Handshake<'a, C> {
    channel: &'a C,
    config: &'a ProtocolConfig,
    state: HandshakeState,
}

impl<'a, C: Channel> Handshake<'a, C> {
    pub fn new(channel: &'a C, config: &'a ProtocolConfig) -> Self {
        Self {
            channel,
            config,
            state: HandshakeState::Init,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn advance(&mut self, next: HandshakeState) {
        if self.state != next {
            log::debug!("[handshake] {} → {next}", self.state);
            self.state = next;
        }
    }

    /// Client side: send `request` to `server` until a usable answer arrives.
    pub async fn connect(
        &mut self,
        server: SocketAddr,
        request: &Request,
    ) -> Result<Established, HandshakeError> {
        let req = request.packet();
        req.encode()?;
        let mut budget = RetryBudget::new(self.config.max_tries);

        while budget.try_consume() {
            self.channel.send_to(&req, server).await?;
            self.advance(HandshakeState::AwaitResponse);
            log::debug!("[handshake] → {req} to {server} (attempt {})", budget.used());

            let deadline = Instant::now() + self.config.handshake_timeout;
            while let Received::Packet(reply, from) = self.channel.recv_until(deadline).await? {
                log::debug!("[handshake] ← {reply} from {from}");
                match (reply.kind, request.direction) {
                    (Kind::Error, _) => {
                        let message = reply.text();
                        self.channel.send_to(&Packet::ack(reply.seq), from).await?;
                        self.advance(HandshakeState::Rejected);
                        return Err(HandshakeError::Rejected(message));
                    }
                    (Kind::Ack, Direction::Upload) if reply.seq == 0 => {
                        self.advance(HandshakeState::Established);
                        return Ok(Established {
                            peer: from,
                            first: None,
                        });
                    }
                    (Kind::Data | Kind::Close, Direction::Download) => {
                        self.advance(HandshakeState::Established);
                        return Ok(Established {
                            peer: from,
                            first: Some(reply),
                        });
                    }
                    _ => {}
                }
            }
        }

        self.advance(HandshakeState::Failed);
        Err(HandshakeError::TimedOut {
            attempts: budget.used(),
        })
    }

    /// Worker side: answer `client`'s request with `reply`.
    ///
    /// A rejection is only complete once the client acknowledges the ERROR;
    /// it is then reported as [`HandshakeError::Rejected`].
    pub async fn accept(
        &mut self,
        client: SocketAddr,
        direction: Direction,
        reply: &Reply,
    ) -> Result<Established, HandshakeError> {
        match (reply, direction) {
            (Reply::Accept, Direction::Download) => {
                self.advance(HandshakeState::Established);
                Ok(Established {
                    peer: client,
                    first: None,
                })
            }
            (Reply::Accept, Direction::Upload) => {
                let first = self
                    .repeat_until(client, &Packet::ack(0), |p| {
                        matches!(p.kind, Kind::Data | Kind::Close)
                    })
                    .await?;
                self.advance(HandshakeState::Established);
                Ok(Established {
                    peer: client,
                    first: Some(first),
                })
            }
            (Reply::Reject(message), _) => {
                self.repeat_until(client, &Packet::error(0, message), |p| p.kind == Kind::Ack)
                    .await?;
                self.advance(HandshakeState::Rejected);
                Err(HandshakeError::Rejected(message.clone()))
            }
        }
    }

    /// Send `packet` to `client` every handshake timeout until a packet from
    /// `client` satisfies `done`.
    async fn repeat_until(
        &mut self,
        client: SocketAddr,
        packet: &Packet,
        done: fn(&Packet) -> bool,
    ) -> Result<Packet, HandshakeError> {
        let mut budget = RetryBudget::new(self.config.max_tries);

        while budget.try_consume() {
            self.channel.send_to(packet, client).await?;
            self.advance(HandshakeState::AwaitResponse);
            log::debug!("[handshake] → {packet} to {client} (attempt {})", budget.used());

            let deadline = Instant::now() + self.config.handshake_timeout;
            while let Received::Packet(answer, from) = self.channel.recv_until(deadline).await? {
                if from == client && done(&answer) {
                    log::debug!("[handshake] ← {answer} from {from}");
                    return Ok(answer);
                }
            }
        }

        self.advance(HandshakeState::Failed);
        Err(HandshakeError::TimedOut {
            attempts: budget.used(),
        })
    }
}
