use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Number of attempts after which a failing job is abandoned.
pub const MAX_ATTEMPTS: i32 = 25;

/// Controls how failed jobs are retried.
///
/// The delay before retry `n` (counting from zero) is
/// `min_backoff * 2^n`, capped at `max_backoff`, plus up to
/// `backoff_jitter_pct` percent of random extra delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a job is abandoned, the first run included.
    pub max_attempts: i32,
    /// Delay before the first retry.
    pub min_backoff: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_backoff: Duration,
    /// Percentage (0-100) of random extra delay.
    pub backoff_jitter_pct: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        const SECS_IN_ONE_HOUR: u64 = 60 * 60;
        Self {
            max_attempts: MAX_ATTEMPTS,
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(SECS_IN_ONE_HOUR),
            backoff_jitter_pct: 20,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, which is mostly useful in tests.
    pub fn immediate(max_attempts: i32) -> Self {
        Self {
            max_attempts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_jitter_pct: 0,
        }
    }

    /// Whether a job that just failed with `attempts` previous failures
    /// gets another try.
    pub fn should_retry(&self, attempts: i32) -> bool {
        attempts.saturating_add(1) < self.max_attempts
    }

    /// Delay before the retry following `attempts` previous failures.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = u32::try_from(attempts).unwrap_or(0).min(31);
        let base = self
            .min_backoff
            .checked_mul(1 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);

        if self.backoff_jitter_pct == 0 || base.is_zero() {
            return base;
        }

        let base_millis = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jitter_millis = base_millis / 100 * u64::from(self.backoff_jitter_pct.min(100));
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        base + Duration::from_millis(random_jitter)
    }

    /// When a job failing now after `attempts` previous failures runs again.
    pub fn next_run_at(&self, now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.backoff(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
