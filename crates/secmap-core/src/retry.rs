//! Retry policy with capped exponential backoff, shared by both stages.

use std::time::Duration;

use serde::Serialize;

use crate::provider::CallOutcome;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Doubles from `base` on every retry, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub const fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential { base, max }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => {
                let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Bounded attempts with one backoff for throttled calls and another for
/// every other failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub throttled: Backoff,
    pub failure: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            throttled: Backoff::exponential(Duration::from_millis(700), Duration::from_secs(8)),
            failure: Backoff::exponential(Duration::from_millis(500), Duration::from_secs(5)),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Policy with no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        let none = Backoff::Fixed {
            delay: Duration::ZERO,
        };
        Self {
            max_attempts,
            throttled: none,
            failure: none,
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32, outcome: CallOutcome) -> Duration {
        let backoff = match outcome {
            CallOutcome::RateLimited => self.throttled,
            CallOutcome::Success | CallOutcome::ServerError | CallOutcome::Other => self.failure,
        };
        backoff.delay(attempt.saturating_sub(1))
    }
}
