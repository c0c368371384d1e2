//! Handshake finite-state machine and session classification types.
//!
//! [`HandshakeState`] tracks where one side of the opening exchange stands.
//! Transitions are driven by [`crate::handshake`]; keeping the types here
//! lets the connection and transfer layers log and match on them without
//! depending on handshake plumbing.

use std::fmt;

use crate::packet::Kind;

/// States of the handshake FSM.
///
/// ```text
///  INIT ──request sent──▶ AWAIT_RESPONSE ──positive reply──▶ ESTABLISHED
///                              │    │
///                      ERROR   │    │  retry budget spent
///                              ▼    ▼
///                        REJECTED  FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Nothing sent yet.
    #[default]
    Init,
    /// Request (client) or reply (worker) sent; waiting for the peer.
    AwaitResponse,
    /// Both ends agree the transfer may start.
    Established,
    /// The server refused the request; both ends know it.
    Rejected,
    /// No usable answer within the retry budget.
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Init => "INIT",
            HandshakeState::AwaitResponse => "AWAIT_RESPONSE",
            HandshakeState::Established => "ESTABLISHED",
            HandshakeState::Rejected => "REJECTED",
            HandshakeState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Which way file bytes flow, named from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    /// Request kind that opens a transfer in this direction.
    pub fn request_kind(self) -> Kind {
        match self {
            Direction::Upload => Kind::Upload,
            Direction::Download => Kind::Download,
        }
    }

    pub fn from_kind(kind: Kind) -> Option<Self> {
        match kind {
            Kind::Upload => Some(Direction::Upload),
            Kind::Download => Some(Direction::Download),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.request_kind(), f)
    }
}

/// Which end of a transfer the local process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Whether the local end reads the file and sends DATA, or receives DATA
/// and writes the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn of(side: Side, direction: Direction) -> Self {
        match (side, direction) {
            (Side::Client, Direction::Upload) | (Side::Server, Direction::Download) => Role::Sender,
            (Side::Client, Direction::Download) | (Side::Server, Direction::Upload) => {
                Role::Receiver
            }
        }
    }
}

/// Automatic-repeat-request algorithm used for the data phase.
///
/// The wire carries no mode field; both ends must be configured alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArqMode {
    #[default]
    StopAndWait,
    SelectiveRepeat,
}

impl fmt::Display for ArqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArqMode::StopAndWait => f.write_str("stop-and-wait"),
            ArqMode::SelectiveRepeat => f.write_str("selective-repeat"),
        }
    }
}
