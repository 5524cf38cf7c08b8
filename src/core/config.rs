//! Timing and tuning parameters for the consensus core.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

/// Tuning knobs for elections, replication, and membership changes.
///
/// `follower_timeout` should be at least an order of magnitude larger than
/// `heartbeat_period`, so a healthy leader refreshes followers many times
/// before any of them considers an election.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Inactivity period after which a follower becomes a candidate.
    /// Election timeouts are jittered uniformly in [1x, 2x] of this value.
    pub follower_timeout: Duration,
    /// How often a leader contacts each follower even without new entries.
    pub heartbeat_period: Duration,
    /// Wait after a failed RPC before contacting the same peer again.
    pub rpc_failure_backoff: Duration,
    /// Preferred upper bound on the payload bytes carried by one AppendEntry.
    pub soft_rpc_size_limit: usize,
    /// A staging server counts as caught up once a single catch-up iteration
    /// completes within this bound.
    pub catch_up_timeout: Duration,
    /// Catch-up iterations granted to a staging server before the membership
    /// change is abandoned.
    pub max_catch_up_rounds: u64,
    /// Seed for election jitter; fixed seeds make tests reproducible.
    pub seed: Option<u64>,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            follower_timeout: Duration::from_millis(500),
            heartbeat_period: Duration::from_millis(50),
            rpc_failure_backoff: Duration::from_millis(100),
            soft_rpc_size_limit: 1024 * 1024,
            catch_up_timeout: Duration::from_millis(500),
            max_catch_up_rounds: 10,
            seed: None,
        }
    }
}

impl RaftOptions {
    pub fn with_follower_timeout(mut self, timeout: Duration) -> Self {
        self.follower_timeout = timeout;
        self
    }

    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn with_rpc_failure_backoff(mut self, backoff: Duration) -> Self {
        self.rpc_failure_backoff = backoff;
        self
    }

    pub fn with_catch_up(mut self, timeout: Duration, rounds: u64) -> Self {
        self.catch_up_timeout = timeout;
        self.max_catch_up_rounds = rounds;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Jittered election timeout. `attempt` counts elections since this
    /// server became a candidate (0 for the follower timer); later attempts
    /// wait longer so that colliding candidates spread out.
    pub fn election_timeout(&self, rng: &mut StdRng, attempt: u64) -> Duration {
        let base = self.follower_timeout.as_millis() as u64;
        let jittered = base + rng.random_range(0..=base);
        Duration::from_millis(jittered.saturating_mul(attempt.max(1)))
    }
}
