//! Test fixtures and driver helpers.
//!
//! Provides convenience functions for wiring a [`LedgerDriver`] to an
//! [`InMemoryLedger`] and for common test scenarios.

use crate::ledger::{InMemoryLedger, LedgerConfig};
use ledger_driver::{Communicator, DriverConfig, DriverResult, LedgerDriver, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Name of the ledger used by the fixtures.
pub const TEST_LEDGER: &str = "test-ledger";

/// A driver connected to its own in-memory ledger.
pub struct TestLedger {
    /// The service.
    pub ledger: Arc<InMemoryLedger>,
    /// The driver.
    pub driver: LedgerDriver,
}

impl TestLedger {
    /// Creates a ledger and a driver with instant retries.
    pub fn new() -> Self {
        Self::with_configs(LedgerConfig::default(), fast_retry_config())
    }

    /// Creates a ledger and a driver from explicit configurations.
    pub fn with_configs(ledger_config: LedgerConfig, driver_config: DriverConfig) -> Self {
        let ledger = Arc::new(InMemoryLedger::with_config(
            driver_config.ledger_name.clone(),
            ledger_config,
        ));
        let driver = LedgerDriver::new(
            driver_config,
            Arc::clone(&ledger) as Arc<dyn Communicator>,
        )
        .expect("Failed to create driver");
        Self { ledger, driver }
    }
}

impl Default for TestLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestLedger {
    type Target = LedgerDriver;

    fn deref(&self) -> &Self::Target {
        &self.driver
    }
}

/// Driver configuration for [`TEST_LEDGER`] whose retries never sleep.
pub fn fast_retry_config() -> DriverConfig {
    DriverConfig::new(TEST_LEDGER)
        .with_retry_policy(instant_retry_policy(4))
        .with_pool_acquire_timeout(Duration::from_secs(10))
        .with_session_creation_backoff(Duration::ZERO)
}

/// Retry policy with the given limit and zero backoff.
pub fn instant_retry_policy(retry_limit: u32) -> RetryPolicy {
    RetryPolicy::new(retry_limit).with_custom_backoff(|_, _, _| Duration::ZERO)
}

/// Runs a test with a fresh driver and ledger.
///
/// # Example
///
/// ```rust
/// use ledger_testkit::with_test_ledger;
///
/// with_test_ledger(|driver, ledger| {
///     driver
///         .execute(|tx| {
///             tx.execute_statement("CREATE TABLE cars", &[])?;
///             Ok(())
///         })
///         .unwrap();
///     assert_eq!(ledger.table_names(), vec!["cars"]);
/// });
/// ```
pub fn with_test_ledger<F, R>(f: F) -> R
where
    F: FnOnce(&LedgerDriver, &InMemoryLedger) -> R,
{
    let test = TestLedger::new();
    f(&test.driver, &test.ledger)
}

/// A bank account document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owner name.
    pub owner: String,
    /// Balance in cents.
    pub balance: i64,
}

impl Account {
    /// Creates an account.
    pub fn new(owner: impl Into<String>, balance: i64) -> Self {
        Self {
            owner: owner.into(),
            balance,
        }
    }
}

/// Reads an account inside a transaction.
pub fn read_account<K: ledger_driver::Codec>(
    tx: &mut ledger_driver::ExecutionContext<'_, K>,
    table: &str,
    key: &str,
) -> DriverResult<Option<Account>> {
    let rows = tx
        .execute_statement_with(&format!("SELECT * FROM {table} WHERE id = ?"), &[key])?
        .buffer()?;
    match rows.values().first() {
        Some(row) => Ok(Some(tx.decode(row)?)),
        None => Ok(None),
    }
}

/// Overwrites an account inside a transaction.
pub fn write_account<K: ledger_driver::Codec>(
    tx: &mut ledger_driver::ExecutionContext<'_, K>,
    table: &str,
    key: &str,
    account: &Account,
) -> DriverResult<()> {
    let params = [tx.encode(account)?, tx.encode(key)?];
    tx.execute_statement(&format!("UPDATE {table} SET ? WHERE id = ?"), &params)?;
    Ok(())
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Table used by [`accounts_ledger`].
    pub const ACCOUNTS: &str = "accounts";

    /// Creates a ledger with `count` documents `doc-0..doc-N` in `table`.
    pub fn populated_ledger(table: &str, count: usize) -> TestLedger {
        let test = TestLedger::new();
        test.ledger.create_table(table);
        for i in 0..count {
            test.ledger
                .put_document(table, &format!("doc-{i}"), &i)
                .expect("Failed to put document");
        }
        test
    }

    /// Creates a ledger with `count` accounts `acct-0..acct-N`, each holding `balance`.
    pub fn accounts_ledger(count: usize, balance: i64) -> TestLedger {
        let test = TestLedger::new();
        test.ledger.create_table(ACCOUNTS);
        for i in 0..count {
            test.ledger
                .put_document(ACCOUNTS, &format!("acct-{i}"), &Account::new(format!("owner-{i}"), balance))
                .expect("Failed to put account");
        }
        test
    }
}
