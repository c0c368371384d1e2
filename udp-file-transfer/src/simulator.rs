//! Fault-injecting channel for deterministic testing.
//!
//! Real networks drop and duplicate packets.  To exercise the reliability
//! mechanisms without depending on actual network conditions, [`Simulator`]
//! wraps any [`Channel`] and intercepts outbound packets, applying a fault
//! model:
//!
//! | Fault        | Description                                           |
//! |--------------|-------------------------------------------------------|
//! | Packet loss  | Drop a packet with probability `loss_rate`.           |
//! | Duplication  | Deliver a packet twice with probability `duplicate_rate`. |
//! | Scripted     | Drop the first packet matching a `(kind, seq)` rule.  |
//!
//! Random faults draw from a `StdRng` seeded from [`FaultConfig::seed`], so a
//! failing run can be replayed exactly.  Inbound traffic passes through
//! untouched: faults on the return path are modelled by wrapping the peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::{Kind, Packet};
use crate::socket::{Channel, SocketError};

/// Configuration for the fault-injection model.
///
/// Probabilities are clamped into `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Deliver,
    Drop,
    Duplicate,
}

struct FaultState {
    rng: StdRng,
    scripted: Vec<(Kind, u16)>,
}

/// A fault-injecting wrapper around another channel.
pub struct Simulator<C> {
    inner: C,
    config: FaultConfig,
    state: Mutex<FaultState>,
    dropped: AtomicU64,
    duplicated: AtomicU64,
}

impl<C: Channel> Simulator<C> {
    pub fn new(inner: C, config: FaultConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            state: Mutex::new(FaultState {
                rng,
                scripted: Vec::new(),
            }),
            dropped: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
        }
    }

    /// Pass-through simulator (no random faults).
    pub fn transparent(inner: C) -> Self {
        Self::new(inner, FaultConfig::default())
    }

    /// Drop the first outbound packet of `kind` carrying `seq`.  Rules fire
    /// once each; add the same rule twice to drop two copies.
    pub fn drop_once(self, kind: Kind, seq: u16) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.scripted.push((kind, seq));
        }
        self
    }

    /// Packets discarded so far (random and scripted).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Packets sent twice so far.
    pub fn duplicated(&self) -> u64 {
        self.duplicated.load(Ordering::Relaxed)
    }

    fn fate(&self, packet: &Packet) -> Fate {
        let Ok(mut state) = self.state.lock() else {
            return Fate::Deliver;
        };
        if let Some(pos) = state
            .scripted
            .iter()
            .position(|&(kind, seq)| kind == packet.kind && seq == packet.seq)
        {
            state.scripted.remove(pos);
            return Fate::Drop;
        }
        if state.rng.random_bool(self.config.loss_rate.clamp(0.0, 1.0)) {
            return Fate::Drop;
        }
        if state.rng.random_bool(self.config.duplicate_rate.clamp(0.0, 1.0)) {
            return Fate::Duplicate;
        }
        Fate::Deliver
    }
}

impl<C: Channel> Channel for Simulator<C> {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        match self.fate(packet) {
            Fate::Drop => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("[sim] dropped {packet} to {dest}");
                Ok(())
            }
            Fate::Duplicate => {
                self.duplicated.fetch_add(1, Ordering::Relaxed);
                log::debug!("[sim] duplicated {packet} to {dest}");
                self.inner.send_to(packet, dest).await?;
                self.inner.send_to(packet, dest).await
            }
            Fate::Deliver => self.inner.send_to(packet, dest).await,
        }
    }

    async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        self.inner.recv_from().await
    }
}
