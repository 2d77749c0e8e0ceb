//! Timing knobs for rollout and rollback controllers.

use std::time::Duration;

use rollgate_core::Timings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutSettings {
    /// Pause between status polls.
    pub poll_interval: Duration,
    pub rollout_timeout: Duration,
    /// Wait between "available" and the first health verification.
    pub settle_delay: Duration,
    pub rollback_timeout: Duration,
    /// Verifications allowed while every category errors.
    pub max_verify_attempts: u32,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self::from(&Timings::default())
    }
}

impl From<&Timings> for RolloutSettings {
    fn from(timings: &Timings) -> Self {
        Self {
            poll_interval: timings.poll_interval,
            rollout_timeout: timings.rollout_timeout,
            settle_delay: timings.settle_delay,
            rollback_timeout: timings.rollback_timeout,
            max_verify_attempts: timings.max_verify_attempts.max(1),
        }
    }
}
