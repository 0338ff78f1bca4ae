//! Pure reconnection decisions
//!
//! The delay before retry `k` (0-indexed) is `base_delay * 2^k`, clamped to
//! `max_delay`. No jitter is applied, so schedules are reproducible under a
//! paused clock.

use std::time::Duration;

/// Backoff and attempt cap for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total connect attempts before the session fails for good
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay scheduled after connect attempt `attempt` fails
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Longest time a session can spend retrying before it fails
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.backoff_delay(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// What to do after a connect attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { next_attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Decide whether to retry after attempt `failed_attempt` (0-indexed) failed
pub fn decide(
    failed_attempt: u32,
    policy: &ReconnectPolicy,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }
    if failed_attempt.saturating_add(1) >= policy.max_attempts {
        return ReconnectionDecision::AbortMaxAttemptsExceeded;
    }
    ReconnectionDecision::Proceed {
        next_attempt: failed_attempt + 1,
        delay: policy.backoff_delay(failed_attempt),
    }
}
