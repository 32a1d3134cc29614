use std::time::Duration;

use anyhow::{ensure, Result};
use rand::Rng;

use crate::transport::RetryPolicy;

/// Failure detector and election timers.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Period of the leader's heartbeat broadcast.
    pub heartbeat_interval: Duration,
    /// Silence after which a follower campaigns. Must exceed the interval.
    pub heartbeat_timeout: Duration,
    /// Bounds of the random pause before each vote request.
    pub vote_jitter_min: Duration,
    pub vote_jitter_max: Duration,
    /// How long a write waits for quorum before failing.
    pub quorum_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(3),
            vote_jitter_min: Duration::from_millis(150),
            vote_jitter_max: Duration::from_millis(300),
            quorum_timeout: Duration::from_secs(5),
        }
    }
}

impl Timing {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.heartbeat_interval.is_zero(),
            "heartbeat interval must be positive"
        );
        ensure!(
            self.heartbeat_timeout > self.heartbeat_interval,
            "heartbeat timeout ({:?}) must exceed heartbeat interval ({:?})",
            self.heartbeat_timeout,
            self.heartbeat_interval
        );
        ensure!(
            self.vote_jitter_min <= self.vote_jitter_max,
            "vote jitter min must not exceed max"
        );
        ensure!(!self.quorum_timeout.is_zero(), "quorum timeout must be positive");
        Ok(())
    }

    pub fn vote_jitter(&self) -> Duration {
        if self.vote_jitter_min == self.vote_jitter_max {
            return self.vote_jitter_min;
        }
        rand::thread_rng().gen_range(self.vote_jitter_min..=self.vote_jitter_max)
    }

    /// How often the timeout watcher samples the heartbeat clock.
    pub fn watch_interval(&self) -> Duration {
        (self.heartbeat_timeout / 4).max(Duration::from_millis(5))
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address peers and clients use to reach this node.
    pub public_address: String,
    pub timing: Timing,
    pub retry: RetryPolicy,
}

impl NodeConfig {
    pub fn new(public_address: impl Into<String>) -> Self {
        Self {
            public_address: public_address.into(),
            timing: Timing::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.public_address.is_empty(),
            "public address cannot be empty"
        );
        ensure!(self.retry.max_attempts > 0, "retry policy needs at least one attempt");
        self.timing.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        NodeConfig::new("127.0.0.1:7001")
            .validate()
            .expect("default config should validate");
    }

    #[test]
    fn timeout_must_exceed_heartbeat_interval() {
        let timing = Timing {
            heartbeat_timeout: Duration::from_secs(2),
            ..Timing::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let timing = Timing::default();
        for _ in 0..100 {
            let jitter = timing.vote_jitter();
            assert!(jitter >= timing.vote_jitter_min && jitter <= timing.vote_jitter_max);
        }
    }
}
