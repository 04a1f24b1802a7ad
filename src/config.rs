use std::time::Duration;

use rand::Rng;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election timeout range is empty ({min:?}..={max:?})")]
    ElectionRange { min: Duration, max: Duration },
    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeat,
    #[error("lease duration {lease:?} must exceed the heartbeat interval {heartbeat:?}")]
    LeaseTooShort { lease: Duration, heartbeat: Duration },
}

/// Timer configuration. These values tune liveness only; safety never depends on them
/// beyond the lease being longer than a heartbeat round.
#[derive(Clone, Debug)]
pub struct TimerConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// How long a leader may answer reads after a majority-acknowledged heartbeat round.
    pub lease_duration: Duration,
    /// Upper bound on a vote round before the tally is closed.
    pub rpc_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_secs(5),
            election_timeout_max: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            lease_duration: Duration::from_millis(2500),
            rpc_timeout: Duration::from_secs(1),
        }
    }
}

impl TimerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min.is_zero()
            || self.election_timeout_min > self.election_timeout_max
        {
            return Err(ConfigError::ElectionRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.lease_duration <= self.heartbeat_interval {
            return Err(ConfigError::LeaseTooShort {
                lease: self.lease_duration,
                heartbeat: self.heartbeat_interval,
            });
        }
        Ok(())
    }

    /// §5.2: randomized so that nodes time out at different moments,
    /// preventing repeated split votes when multiple candidates start at once.
    pub fn random_election_timeout(&self) -> Duration {
        if self.election_timeout_min >= self.election_timeout_max {
            return self.election_timeout_min;
        }
        rand::rng().random_range(self.election_timeout_min..=self.election_timeout_max)
    }
}
