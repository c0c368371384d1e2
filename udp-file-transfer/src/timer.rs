//! Retry budgets and liveness tracking.
//!
//! Reliable delivery needs two kinds of timing bookkeeping besides the
//! per-packet deadlines kept by the ARQ state machines:
//! - [`RetryBudget`] bounds how many times the handshake and CLOSE are
//!   (re)sent before the exchange is declared failed.
//! - [`IdleWatch`] notices a peer that has gone silent during an established
//!   transfer, so a worker never waits forever on an abandoned client.
//!
//! Timeouts are fixed values from [`crate::config::ProtocolConfig`]; there is
//! no adaptive RTO because congestion control is out of scope.

use std::time::Duration;

use tokio::time::Instant;

/// Counts transmission attempts against a fixed maximum.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Consume one attempt.  Returns `false` once the budget is spent, in
    /// which case nothing is consumed.
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }

    /// Attempts made so far.
    pub fn used(&self) -> u32 {
        self.used
    }
}

/// Tracks the last time anything arrived from the peer.
#[derive(Debug, Clone)]
pub struct IdleWatch {
    limit: Duration,
    last_heard: Instant,
}

impl IdleWatch {
    /// Start watching now with the given silence limit.
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            last_heard: Instant::now(),
        }
    }

    /// Record that a packet from the peer arrived.
    pub fn heard(&mut self) {
        self.last_heard = Instant::now();
    }

    /// `true` when the peer has been silent for longer than the limit.
    pub fn expired(&self) -> bool {
        self.last_heard.elapsed() > self.limit
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}
