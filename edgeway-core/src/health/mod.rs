//! Health check policy and hysteresis thresholds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::time::serde_secs;

/// Errors raised when a [`HealthCheckPolicy`] is unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The probe interval must be non-zero.
    #[error("health check interval must be greater than zero")]
    ZeroInterval,
    /// The probe timeout must be non-zero.
    #[error("health check timeout must be greater than zero")]
    ZeroTimeout,
    /// `fail_threshold` must be at least 1.
    #[error("fail threshold must be at least 1")]
    ZeroFailThreshold,
    /// `succ_threshold` must be at least 1.
    #[error("success threshold must be at least 1")]
    ZeroSuccessThreshold,
}

/// How often nodes are probed and how many consecutive observations flip their state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckPolicy {
    /// Period between probe passes.
    #[serde(with = "serde_secs")]
    pub interval: Duration,
    /// Deadline for a single probe.
    #[serde(with = "serde_secs")]
    pub timeout: Duration,
    /// Consecutive failures required to mark a healthy node unhealthy.
    pub fail_threshold: u32,
    /// Consecutive successes required to mark an unhealthy node healthy.
    pub succ_threshold: u32,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            fail_threshold: 3,
            succ_threshold: 2,
        }
    }
}

impl HealthCheckPolicy {
    /// Build a policy, clamping both thresholds to at least 1.
    pub fn new(
        interval: Duration,
        timeout: Duration,
        fail_threshold: u32,
        succ_threshold: u32,
    ) -> Self {
        Self {
            interval,
            timeout,
            fail_threshold: fail_threshold.max(1),
            succ_threshold: succ_threshold.max(1),
        }
    }

    /// Reject policies that would never probe or never flip state.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.interval.is_zero() {
            return Err(PolicyError::ZeroInterval);
        }
        if self.timeout.is_zero() {
            return Err(PolicyError::ZeroTimeout);
        }
        if self.fail_threshold == 0 {
            return Err(PolicyError::ZeroFailThreshold);
        }
        if self.succ_threshold == 0 {
            return Err(PolicyError::ZeroSuccessThreshold);
        }
        Ok(())
    }
}
