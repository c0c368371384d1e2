//! Tunable protocol and process configuration.
//!
//! Nothing in the protocol layer reads a global: every timeout, the window
//! size and the retry budget travel in a [`ProtocolConfig`] handed to each
//! component when it is built.  Tests run many configurations side by side
//! in one process this way.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::state::ArqMode;

/// Timing and window parameters consumed by the handshake, both ARQ modes
/// and teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// How long to wait for a handshake or CLOSE reply before resending.
    pub handshake_timeout: Duration,
    /// Stop-and-Wait: wait for the ACK of the outstanding DATA.
    pub sw_sender_timeout: Duration,
    /// Stop-and-Wait: receive poll interval.
    pub sw_receiver_timeout: Duration,
    /// Selective-Repeat: per-record retransmission deadline.
    pub sr_sender_timeout: Duration,
    /// Selective-Repeat: receive poll interval.
    pub sr_receiver_timeout: Duration,
    /// Selective-Repeat window size (records in flight / slots buffered).
    pub window_size: usize,
    /// Attempts allowed for the handshake and for CLOSE.
    pub max_tries: u32,
    /// An established transfer is abandoned after hearing nothing from the
    /// peer for this long.
    pub idle_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(250),
            sw_sender_timeout: Duration::from_millis(30),
            sw_receiver_timeout: Duration::from_millis(30),
            sr_sender_timeout: Duration::from_millis(50),
            sr_receiver_timeout: Duration::from_millis(50),
            window_size: 32,
            max_tries: 15,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl ProtocolConfig {
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    /// How long the dispatcher treats a repeated request from the same client
    /// as a retransmission: the full handshake retry window.
    pub fn handshake_window(&self) -> Duration {
        self.handshake_timeout * self.max_tries
    }
}

/// Settings for one `server` process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Rendezvous address clients send requests to.
    pub bind: SocketAddr,
    /// Directory files are served from and stored into.
    pub storage: PathBuf,
    pub mode: ArqMode,
    /// Fixed number of concurrent transfers.
    pub workers: usize,
    /// Accepted requests allowed to wait for a free worker.
    pub queue_capacity: usize,
    pub verbose: bool,
    pub protocol: ProtocolConfig,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr, storage: impl Into<PathBuf>) -> Self {
        Self {
            bind,
            storage: storage.into(),
            mode: ArqMode::StopAndWait,
            workers: 10,
            queue_capacity: 64,
            verbose: false,
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Settings for one `upload` or `download` invocation.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub mode: ArqMode,
    pub verbose: bool,
    pub protocol: ProtocolConfig,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            mode: ArqMode::StopAndWait,
            verbose: false,
            protocol: ProtocolConfig::default(),
        }
    }
}
