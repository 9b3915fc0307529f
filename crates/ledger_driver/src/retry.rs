//! Retry policy and backoff.
//!
//! # Backoff Strategy
//!
//! The default backoff uses exponential growth with *equal jitter*:
//! - Seed delay doubles with each attempt: `base * 2^attempt`
//! - The seed is capped at `max_backoff`
//! - Half of the seed is always waited, the other half is drawn uniformly at
//!   random, so concurrent callers that conflicted with each other spread out
//!   instead of retrying in lockstep
//!
//! A custom backoff function replaces the default entirely. It receives the
//! zero-based index of the attempt that just failed, the error it failed
//! with, and its transaction id (absent if the attempt failed before a
//! transaction was started).

use crate::error::DriverError;
use crate::types::TransactionId;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_LIMIT: u32 = 4;

/// Default backoff base.
pub const DEFAULT_BASE: Duration = Duration::from_millis(10);

/// Default upper bound for a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(5000);

// Keeps `base << attempt` from overflowing before the cap applies.
const MAX_SHIFT: u32 = 31;

/// Custom backoff function: `(attempt, error, transaction_id) -> delay`.
pub type BackoffFn =
    Arc<dyn Fn(u32, &DriverError, Option<&TransactionId>) -> Duration + Send + Sync>;

/// Decides whether a failed transaction attempt is retried, and after how long.
#[derive(Clone)]
pub struct RetryPolicy {
    retry_limit: u32,
    base: Duration,
    max_backoff: Duration,
    custom_backoff: Option<BackoffFn>,
}

impl RetryPolicy {
    /// Creates a policy allowing `retry_limit` retries after the first attempt.
    pub fn new(retry_limit: u32) -> Self {
        Self {
            retry_limit,
            base: DEFAULT_BASE,
            max_backoff: DEFAULT_MAX_BACKOFF,
            custom_backoff: None,
        }
    }

    /// Creates a policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    /// Sets the retry limit, keeping the backoff settings.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets the backoff base.
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Sets the maximum backoff delay of the default strategy.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Replaces the default backoff with a custom function.
    ///
    /// The base and maximum backoff settings are ignored when a custom
    /// function is set.
    pub fn with_custom_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32, &DriverError, Option<&TransactionId>) -> Duration + Send + Sync + 'static,
    {
        self.custom_backoff = Some(Arc::new(backoff));
        self
    }

    /// Number of retries allowed after the first attempt.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// The backoff base.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// The maximum delay of the default strategy.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns true if a custom backoff function is set.
    pub fn has_custom_backoff(&self) -> bool {
        self.custom_backoff.is_some()
    }

    /// Returns true if the attempt that failed with `error` may be retried.
    pub fn should_retry(&self, attempt: u32, error: &DriverError) -> bool {
        attempt < self.retry_limit && error.is_retryable()
    }

    /// Computes the delay before the attempt following `attempt`.
    pub fn backoff_delay(
        &self,
        attempt: u32,
        error: &DriverError,
        transaction_id: Option<&TransactionId>,
    ) -> Duration {
        match &self.custom_backoff {
            Some(backoff) => backoff(attempt, error, transaction_id),
            None => self.equal_jitter(attempt),
        }
    }

    fn equal_jitter(&self, attempt: u32) -> Duration {
        let seed = self.seed_delay(attempt);
        let half = seed / 2;
        let half_ms = half.as_millis() as u64;
        let jitter = if half_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half_ms)
        };
        half + Duration::from_millis(jitter)
    }

    /// Delay before jitter: `min(base * 2^attempt, max_backoff)`.
    fn seed_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_SHIFT);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_LIMIT)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_limit", &self.retry_limit)
            .field("base", &self.base)
            .field("max_backoff", &self.max_backoff)
            .field("custom_backoff", &self.custom_backoff.is_some())
            .finish()
    }
}
