use std::time::Duration;

use crate::raft::timer::TimerDuration;

/// Timing configuration for a cluster member.
///
/// All values are in milliseconds. Election and vote timeouts are ranges
/// sampled uniformly each time the timer is armed so that peers started
/// together do not time out in lockstep.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub vote_timeout_min_ms: u64,
    pub vote_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            vote_timeout_min_ms: 150,
            vote_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_vote_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.vote_timeout_min_ms = min_ms;
        self.vote_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn election_timeout(&self) -> TimerDuration {
        TimerDuration::range_ms(self.election_timeout_min_ms, self.election_timeout_max_ms)
    }

    pub fn vote_timeout(&self) -> TimerDuration {
        TimerDuration::range_ms(self.vote_timeout_min_ms, self.vote_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> TimerDuration {
        TimerDuration::Fixed(Duration::from_millis(self.heartbeat_interval_ms))
    }
}

/// Configuration for the in-memory peer registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Lifetime of a published entry. Bound members refresh it every `ttl_ms / 2`.
    pub ttl_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { ttl_ms: 5000 }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis((self.ttl_ms / 2).max(1))
    }
}
