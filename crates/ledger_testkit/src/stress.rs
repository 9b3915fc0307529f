//! Stress tests for the driver.
//!
//! These runs push many transactions through a driver from several threads
//! and report throughput. Contended runs verify that retries preserve
//! every committed update.

use crate::fixtures::{read_account, write_account, Account, TestLedger};
use crate::ledger::{Fault, FaultPoint};
use ledger_driver::LedgerDriver;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Table used by the stress runs.
pub const STRESS_TABLE: &str = "stress";

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total transactions attempted.
    pub total_ops: usize,
    /// Transactions that committed.
    pub successful_ops: usize,
    /// Transactions that failed.
    pub failed_ops: usize,
    /// Retries performed by the driver.
    pub retries: u64,
    /// Total duration.
    pub duration: Duration,
    /// Transactions per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, retries: u64, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            retries,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total transactions: {}", self.total_ops);
        println!("Committed: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Retries: {}", self.retries);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} txn/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of transactions to run.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct documents; fewer means more conflicts.
    pub keys: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            keys: 100,
        }
    }
}

fn key(i: usize) -> String {
    format!("key-{i}")
}

/// Seeds `config.keys` zero-balance accounts in [`STRESS_TABLE`].
pub fn seed_accounts(test: &TestLedger, config: &StressConfig) {
    test.ledger.create_table(STRESS_TABLE);
    for i in 0..config.keys {
        test.ledger
            .put_document(STRESS_TABLE, &key(i), &Account::new(key(i), 0))
            .expect("Failed to seed account");
    }
}

/// Runs sequential inserts of fresh documents.
pub fn stress_sequential_inserts(driver: &LedgerDriver, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let retries_before = driver.stats().retries;
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let key = format!("insert-{i}");
        match driver.execute(|tx| {
            tx.execute_statement_with(
                &format!("INSERT INTO {STRESS_TABLE} ?, ?"),
                &[key.as_str(), "payload"],
            )?;
            Ok(())
        }) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(
        successful,
        failed,
        driver.stats().retries - retries_before,
        start.elapsed(),
    )
}

/// Runs concurrent read-modify-write increments over `config.keys` accounts.
///
/// Accounts must have been seeded with [`seed_accounts`]. After the run the
/// balances sum to the number of committed increments.
pub fn stress_concurrent_increments(driver: &LedgerDriver, config: &StressConfig) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let ops_per_thread = config.operations / config.threads.max(1);
    let keys = config.keys.max(1);
    let retries_before = driver.stats().retries;

    let start = Instant::now();
    thread::scope(|s| {
        for t in 0..config.threads {
            let successful = &successful;
            let failed = &failed;
            s.spawn(move || {
                for i in 0..ops_per_thread {
                    let account_key = key((t * ops_per_thread + i) % keys);
                    let result = driver.execute(|tx| {
                        let mut account = match read_account(tx, STRESS_TABLE, &account_key)? {
                            Some(account) => account,
                            None => return tx.abort(),
                        };
                        account.balance += 1;
                        write_account(tx, STRESS_TABLE, &account_key, &account)
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        driver.stats().retries - retries_before,
        start.elapsed(),
    )
}

/// Runs increments while the service fails every `fault_every`-th commit
/// with a transient fault.
pub fn stress_with_faults(
    test: &TestLedger,
    config: &StressConfig,
    fault_every: usize,
) -> StressTestResult {
    let fault_every = fault_every.max(1);
    let faults = config.operations / fault_every;
    test.ledger
        .inject_times(FaultPoint::Commit, Fault::ConnectionReset, faults);
    stress_concurrent_increments(&test.driver, config)
}

/// Sums the balances of every seeded account.
pub fn total_balance(test: &TestLedger, config: &StressConfig) -> i64 {
    (0..config.keys)
        .filter_map(|i| {
            test.ledger
                .read_document::<Account>(STRESS_TABLE, &key(i))
                .ok()
                .flatten()
        })
        .map(|account| account.balance)
        .sum()
}
