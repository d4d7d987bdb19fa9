//! Retry policy: decides resend delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff between delivery attempts of an unacknowledged task.
///
/// delay = base_delay * multiplier^(attempts - 1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first resend, in milliseconds.
    pub base_delay_ms: u64,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Resend immediately.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the next resend.
    ///
    /// `attempts` is the number of delivery attempts already made (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 1_000,
        }
    }
}
