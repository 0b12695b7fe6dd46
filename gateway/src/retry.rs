//! Bounded exponential backoff for per-target publish retries.

use std::time::Duration;

use rand::Rng;

use crate::error::DeliveryError;

/// Retry policy applied to every (event, target) attempt sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Upper bound for any single backoff delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to each delay.
    pub jitter_factor: f64,

    /// Wall-clock bound for one event across all of its targets.
    pub event_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.2,
            event_deadline: Duration::from_secs(30),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    Retry(Duration),
    /// Stop; the last error is terminal for this target.
    GiveUp,
}

impl RetryPolicy {
    /// Decide whether attempt number `attempt` (1-based), which failed with
    /// `error`, should be followed by another one.
    pub fn decide(&self, attempt: u32, error: &DeliveryError) -> RetryDecision {
        if attempt >= self.max_attempts || !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.backoff(attempt))
    }

    /// Delay after failed attempt `attempt`: `base * 2^(attempt-1)`, capped at
    /// `max_delay`, then jittered and capped again.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = self.base_delay.saturating_mul(multiplier).min(self.max_delay);

        apply_jitter(delay, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomize a delay by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let jitter_range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
