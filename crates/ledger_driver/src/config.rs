//! Configuration for the driver.

use crate::error::{DriverError, DriverResult};
use crate::retry::RetryPolicy;
use std::time::Duration;

/// Default pool capacity.
pub const DEFAULT_MAX_CONCURRENT_TRANSACTIONS: usize = 10;

/// Default time to wait for a pooled session.
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of attempts to start a new session.
pub const DEFAULT_SESSION_CREATION_ATTEMPTS: u32 = 3;

/// Default read-ahead: pages are fetched on demand.
pub const DEFAULT_READ_AHEAD: usize = 0;

/// Configuration for a [`LedgerDriver`](crate::LedgerDriver).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Name of the ledger to connect to.
    pub ledger_name: String,
    /// Service region, if the communicator needs one.
    pub region: Option<String>,
    /// Explicit service endpoint, if any.
    pub endpoint: Option<String>,
    /// Maximum number of sessions leased at the same time.
    pub max_concurrent_transactions: usize,
    /// Default retry policy for transactions.
    pub retry_policy: RetryPolicy,
    /// How long `execute` waits for a pooled session.
    pub pool_acquire_timeout: Duration,
    /// Attempts made to start a new session before giving up.
    pub session_creation_attempts: u32,
    /// Delay unit between session creation attempts (grows linearly).
    pub session_creation_backoff: Duration,
    /// Result pages prefetched per cursor; `0` disables read-ahead.
    pub read_ahead: usize,
}

impl DriverConfig {
    /// Creates a configuration for the given ledger with default settings.
    pub fn new(ledger_name: impl Into<String>) -> Self {
        Self {
            ledger_name: ledger_name.into(),
            region: None,
            endpoint: None,
            max_concurrent_transactions: DEFAULT_MAX_CONCURRENT_TRANSACTIONS,
            retry_policy: RetryPolicy::default(),
            pool_acquire_timeout: DEFAULT_POOL_ACQUIRE_TIMEOUT,
            session_creation_attempts: DEFAULT_SESSION_CREATION_ATTEMPTS,
            session_creation_backoff: Duration::from_millis(10),
            read_ahead: DEFAULT_READ_AHEAD,
        }
    }

    /// Sets the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the pool capacity.
    pub fn with_max_concurrent_transactions(mut self, max: usize) -> Self {
        self.max_concurrent_transactions = max;
        self
    }

    /// Sets the default retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the retry limit of the default retry policy.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_policy = self.retry_policy.with_retry_limit(retry_limit);
        self
    }

    /// Sets the number of result pages buffered ahead of a cursor.
    ///
    /// `0` fetches pages on demand. Otherwise it must be at least 2: a
    /// background thread keeps up to `read_ahead - 1` pages queued.
    pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    /// Sets the pool acquire timeout.
    pub fn with_pool_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_acquire_timeout = timeout;
        self
    }

    /// Sets the number of session creation attempts.
    pub fn with_session_creation_attempts(mut self, attempts: u32) -> Self {
        self.session_creation_attempts = attempts;
        self
    }

    /// Sets the delay unit between session creation attempts.
    pub fn with_session_creation_backoff(mut self, backoff: Duration) -> Self {
        self.session_creation_backoff = backoff;
        self
    }

    /// Checks the configuration for invalid values.
    pub fn validate(&self) -> DriverResult<()> {
        if self.ledger_name.trim().is_empty() {
            return Err(DriverError::invalid_config("ledger_name must not be empty"));
        }
        if self.max_concurrent_transactions == 0 {
            return Err(DriverError::invalid_config(
                "max_concurrent_transactions must be positive",
            ));
        }
        if self.session_creation_attempts == 0 {
            return Err(DriverError::invalid_config(
                "session_creation_attempts must be positive",
            ));
        }
        if self.read_ahead == 1 {
            return Err(DriverError::invalid_config(
                "read_ahead must be 0 or at least 2",
            ));
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_config_builder() {
        let config = DriverConfig::new("vehicle-registration")
            .with_region("us-east-1")
            .with_endpoint("https://session.ledger.example.com")
            .with_max_concurrent_transactions(4)
            .with_pool_acquire_timeout(Duration::from_secs(5))
            .with_retry_limit(2);

        assert_eq!(config.ledger_name, "vehicle-registration");
        assert_eq!(config.region.as_deref(), Some("us-east-1"));
        assert_eq!(
            config.endpoint.as_deref(),
            Some("https://session.ledger.example.com")
        );
        assert_eq!(config.max_concurrent_transactions, 4);
        assert_eq!(config.pool_acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_policy.retry_limit(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults() {
        let config = DriverConfig::new("ledger");
        assert_eq!(config.max_concurrent_transactions, 10);
        assert_eq!(config.retry_policy.retry_limit(), 4);
        assert_eq!(config.pool_acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.session_creation_attempts, 3);
        assert_eq!(config.read_ahead, 0);
    }

    #[test]
    fn retry_limit_keeps_custom_backoff() {
        let policy = RetryPolicy::new(4).with_custom_backoff(|_, _, _| Duration::from_millis(77));
        let config = DriverConfig::new("ledger")
            .with_retry_policy(policy)
            .with_retry_limit(2);

        assert_eq!(config.retry_policy.retry_limit(), 2);
        assert!(config.retry_policy.has_custom_backoff());
        assert_eq!(
            config
                .retry_policy
                .backoff_delay(0, &DriverError::Timeout, None),
            Duration::from_millis(77)
        );
    }

    #[test]
    fn read_ahead_must_be_zero_or_at_least_two() {
        let config = DriverConfig::new("ledger");
        assert!(config.clone().with_read_ahead(0).validate().is_ok());
        assert!(matches!(
            config.clone().with_read_ahead(1).validate(),
            Err(DriverError::InvalidConfig { .. })
        ));
        assert!(config.clone().with_read_ahead(2).validate().is_ok());
        assert!(config.with_read_ahead(16).validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(DriverConfig::default().validate().is_err());
        assert!(DriverConfig::new("ledger")
            .with_max_concurrent_transactions(0)
            .validate()
            .is_err());
        assert!(DriverConfig::new("ledger")
            .with_session_creation_attempts(0)
            .validate()
            .is_err());
    }
}
