//! # Exponential Backoff
//!
//! Provides the two backoff shapes the controller uses:
//!
//! - [`ExponentialBackoff`]: a stateful, step-bounded sequence used by the
//!   conflict-retry wrapper. Sequence with the defaults: 10ms, 20ms, 40ms, 80ms
//!   (four sleeps between five attempts), each capped at 1s.
//! - [`ExponentialBackoff::for_failure_count`]: a stateless per-item delay used
//!   by the work queue's rate limiter: `base * 2^failures`, capped at `max`.

use std::time::Duration;

/// Default number of attempts made by the conflict-retry wrapper
pub const DEFAULT_RETRY_STEPS: u32 = 5;
/// Default first sleep of the conflict-retry wrapper
pub const DEFAULT_RETRY_INITIAL: Duration = Duration::from_millis(10);
/// Default cap on a single conflict-retry sleep
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(1);

/// Exponential backoff calculator
///
/// Each call to [`next_backoff`](Self::next_backoff) returns the current delay
/// and multiplies it by `factor` for the next call, capped at `max`. After
/// `steps - 1` delays the sequence is exhausted and `None` is returned, which
/// bounds a retry loop to `steps` attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial delay (for reset)
    initial: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Multiplier applied after every delay
    factor: u32,
    /// Maximum single delay
    max: Duration,
    /// Total attempts allowed
    steps: u32,
    /// Delays handed out so far
    taken: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    ///
    /// # Arguments
    ///
    /// * `initial` - First delay
    /// * `factor` - Multiplier between consecutive delays (typically 2)
    /// * `max` - Cap on any single delay
    /// * `steps` - Total attempts the caller may make; `steps - 1` delays are produced
    #[must_use]
    pub fn new(initial: Duration, factor: u32, max: Duration, steps: u32) -> Self {
        Self {
            initial,
            current: initial,
            factor,
            max,
            steps,
            taken: 0,
        }
    }

    /// Get the next delay and advance the sequence, or `None` once exhausted
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.taken.saturating_add(1) >= self.steps {
            return None;
        }
        self.taken += 1;
        let result = std::cmp::min(self.current, self.max);
        self.current = self.current.saturating_mul(self.factor);
        Some(result)
    }

    /// Reset the backoff to the initial state
    #[allow(dead_code)] // Each retry loop takes a fresh clone instead
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.taken = 0;
    }

    /// Calculate the delay for an item that has failed `failures` times (stateless)
    ///
    /// The sequence starts at `base` for the first failure (count 0) and
    /// doubles per failure: base, base*2, base*4, ..., capped at `max`.
    /// Large failure counts saturate at `max` instead of overflowing.
    #[must_use]
    pub fn for_failure_count(failures: u32, base: Duration, max: Duration) -> Duration {
        let multiplier = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        std::cmp::min(base.saturating_mul(multiplier), max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INITIAL, 2, DEFAULT_RETRY_MAX, DEFAULT_RETRY_STEPS)
    }
}
