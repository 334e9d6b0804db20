//! Retry policy with exponential backoff and full jitter.
//!
//! The delay for attempt `k` is drawn uniformly from
//! `[0, min(base * 2^k, max_delay))`. Full jitter spreads retries from many
//! tenants across the whole backoff window instead of synchronizing them at
//! its upper edge.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Retry policy for failed outbound deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts, including the initial one.
    pub max_attempts: u32,

    /// Base delay for the exponential backoff calculation.
    pub base_delay: Duration,

    /// Cap on the backoff ceiling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(512),
        }
    }
}

/// Result of a retry decision for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// Jittered delay until the next attempt.
        delay: Duration,
    },
    /// Do not retry; the delivery is terminally failed.
    GiveUp {
        /// Why the delivery will not be retried.
        reason: String,
    },
}

impl RetryPolicy {
    /// Upper bound of the backoff window for the given attempt number.
    ///
    /// `min(base * 2^attempt, max_delay)`. The exponent is clamped so large
    /// attempt numbers cannot overflow.
    pub fn backoff_ceiling(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let raw = self.base_delay.saturating_mul(multiplier);
        raw.min(self.max_delay)
    }

    /// Samples a jittered delay for the given attempt number.
    pub fn jittered_delay(&self, attempt_number: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt_number);
        if ceiling.is_zero() {
            return ceiling;
        }

        let mut rng = rand::rng();
        let fraction: f64 = rng.random_range(0.0..1.0);
        Duration::from_secs_f64(ceiling.as_secs_f64() * fraction)
    }

    /// Decides whether a failed attempt should be retried.
    ///
    /// Gives up when the error is not transient or the attempt budget is
    /// spent. Circuit-open rejections do not reach this method: the
    /// dispatcher defers them until the breaker admits traffic again, without
    /// consuming budget.
    pub fn decide(&self, attempt_number: u32, error: &EngineError) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts),
            };
        }

        RetryDecision::Retry { delay: self.jittered_delay(attempt_number) }
    }
}
