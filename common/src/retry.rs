// Retry strategy implementation with exponential backoff and optional jitter
// Used for job retries (no jitter, so retry times stay deterministic) and for
// lease renewal retries (jittered to avoid a thundering herd at the issuer).

use rand::Rng;
use std::time::Duration;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before the next attempt, given how many attempts have been made
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Whether another attempt fits in the attempt budget
    fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }
}

/// Exponential backoff: `min(2^attempt * base, cap)`, plus optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_secs: u64,
    max_delay_secs: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            max_delay_secs: 1800, // 30 minutes
            jitter_factor: 0.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new exponential backoff strategy with custom values.
    /// The cap is raised to the base if configured below it.
    pub fn with_config(base_delay_secs: u64, max_delay_secs: u64, jitter_factor: f64) -> Self {
        let base_delay_secs = base_delay_secs.max(1);
        Self {
            base_delay_secs,
            max_delay_secs: max_delay_secs.max(base_delay_secs),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Exponential delay without jitter
    pub fn base_delay(&self, attempt: u32) -> u64 {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs)
    }

    /// Add random jitter, never exceeding the cap. Returns milliseconds.
    fn add_jitter_ms(&self, base_delay_secs: u64) -> u64 {
        let base_delay_ms = base_delay_secs.saturating_mul(1000);
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms
            .saturating_add(jitter_ms)
            .min(self.max_delay_secs.saturating_mul(1000))
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.add_jitter_ms(self.base_delay(attempt)))
    }
}
