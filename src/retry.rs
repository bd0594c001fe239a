use std::time::Duration;

use serde::Deserialize;

/// Bounded retry with exponential backoff, shared by every dispatch.
///
/// A task gets one first attempt plus up to `max_retries` re-attempts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries, ..Self::default() }
    }

    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self { max_retries, initial_delay_ms: 0, max_delay_ms: 0, backoff_multiplier: 1.0 }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a task that has failed `failed_attempts` times gets another go.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts <= self.max_retries
    }

    /// Wait before the re-attempt that follows `failed_attempts` failures.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 || self.initial_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (failed_attempts - 1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }
}
