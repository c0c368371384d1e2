//! `udp-file-transfer` — reliable file upload and download over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  REQ   ┌────────────┐  Job   ┌──────────────┐
//!  │  client  │───────▶│ dispatcher │───────▶│ worker pool  │
//!  └────┬─────┘        └────────────┘        └──────┬───────┘
//!       │                                           │ fresh socket
//!       │            handshake / DATA / ACK         │
//!       │◀─────────────────────────────────────────▶│
//!  ┌────▼──────────────────────────────┐     ┌──────▼───────┐
//!  │ Transfer (file ⇄ Connection)      │     │   Transfer   │
//!  │  Stop-and-Wait | Selective-Repeat │     │      …       │
//!  └────┬──────────────────────────────┘     └──────────────┘
//!       │ Channel (Socket or Simulator)
//!  ┌────▼──────┐
//!  │  Socket   │  (thin async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]        — wire format (serialise / deserialise)
//! - [`socket`]        — [`socket::Channel`] seam and the UDP socket behind it
//! - [`simulator`]     — fault-injecting channel for tests
//! - [`timer`]         — retry budgets and idle detection
//! - [`state`]         — handshake states, directions, roles, ARQ modes
//! - [`config`]        — protocol constants and endpoint settings
//! - [`handshake`]     — request / reply exchange before data flows
//! - [`sender`]        — Stop-and-Wait outbound state
//! - [`receiver`]      — Stop-and-Wait inbound state
//! - [`sr_sender`]     — Selective-Repeat send window
//! - [`sr_receiver`]   — Selective-Repeat receive window
//! - [`connection`]    — data-phase loops (Stop-and-Wait) and teardown
//! - [`sr_connection`] — data-phase loops (Selective-Repeat)
//! - [`transfer`]      — file staging around a connection
//! - [`client`]        — upload / download entry points
//! - [`server`]        — rendezvous dispatcher and worker pool

pub mod client;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod sr_connection;
pub mod sr_receiver;
pub mod sr_sender;
pub mod state;
pub mod timer;
pub mod transfer;

pub use config::{ClientConfig, ProtocolConfig, ServerConfig};
pub use connection::{TransferError, TransferStats};
pub use state::ArqMode;
