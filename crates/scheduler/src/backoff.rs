//! Table-driven retry backoff.

use chrono::{DateTime, Duration, Utc};

use pubsched_core::{DomainError, DomainResult};

/// Default delay table, in seconds.
pub const DEFAULT_BACKOFF_SECONDS: [u64; 6] = [5, 15, 60, 300, 900, 1800];

/// Default attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Longest accepted retry delay (and scheduling grace): 100 years.
pub const MAX_DELAY_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Retry policy: maps the failed-attempt count to the next retry instant.
///
/// The table is used as given; it is not required to be monotonic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    delays_secs: Vec<u64>,
    max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delays_secs: DEFAULT_BACKOFF_SECONDS.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    pub fn new(delays_secs: Vec<u64>, max_attempts: u32) -> DomainResult<Self> {
        if delays_secs.is_empty() {
            return Err(DomainError::validation("backoff table must not be empty"));
        }
        if let Some(delay) = delays_secs.iter().find(|&&d| d > MAX_DELAY_SECONDS) {
            return Err(DomainError::validation(format!(
                "backoff delay {delay}s exceeds {MAX_DELAY_SECONDS}s"
            )));
        }
        Ok(Self {
            delays_secs,
            max_attempts,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delays_secs(&self) -> &[u64] {
        &self.delays_secs
    }

    /// Delay applied after the `attempts`-th failure (1-indexed).
    ///
    /// Index is `clamp(attempts - 1, 0, len - 1)`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let last = self.delays_secs.len() - 1;
        let index = (attempts.saturating_sub(1) as usize).min(last);
        Duration::seconds(self.delays_secs[index] as i64)
    }

    /// Next retry instant, or `None` once the attempt budget is spent.
    ///
    /// `attempts` already counts the failure being handled. An instant past
    /// the end of the calendar also yields `None`.
    pub fn next_retry(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts >= self.max_attempts {
            return None;
        }
        now.checked_add_signed(self.delay_for_attempt(attempts))
    }
}
