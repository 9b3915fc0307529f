//! The driver facade.

use crate::communicator::Communicator;
use crate::config::DriverConfig;
use crate::cursor::BufferedCursor;
use crate::error::{DriverError, DriverResult};
use crate::executor::{DriverStats, TransactionExecutor};
use crate::pool::{PoolStats, SessionPool};
use crate::retry::RetryPolicy;
use crate::transaction::ExecutionContext;
use ledger_codec::{CborCodec, Codec, WireValue};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Statement listing the active tables of the ledger.
pub const LIST_TABLES_STATEMENT: &str =
    "SELECT VALUE name FROM information_schema.user_tables WHERE status = 'ACTIVE'";

/// Runs transactions against one ledger.
///
/// The driver owns a bounded [`SessionPool`] and a default [`RetryPolicy`].
/// It is `Send + Sync`; share it between threads by reference or `Arc`.
///
/// # Example
///
/// ```ignore
/// let driver = LedgerDriver::new(DriverConfig::new("vehicle-registration"), communicator)?;
/// driver.execute(|tx| {
///     tx.execute_statement_with("INSERT INTO cars ?, ?", &["VIN-1", "red"])?;
///     Ok(())
/// })?;
/// ```
pub struct LedgerDriver<K: Codec = CborCodec> {
    config: DriverConfig,
    pool: SessionPool,
    codec: K,
    stats: RwLock<DriverStats>,
    closed: AtomicBool,
}

impl LedgerDriver<CborCodec> {
    /// Creates a driver using the CBOR codec.
    pub fn new(config: DriverConfig, communicator: Arc<dyn Communicator>) -> DriverResult<Self> {
        Self::with_codec(config, communicator, CborCodec::new())
    }
}

impl<K: Codec> LedgerDriver<K> {
    /// Creates a driver with a custom codec.
    pub fn with_codec(
        config: DriverConfig,
        communicator: Arc<dyn Communicator>,
        codec: K,
    ) -> DriverResult<Self> {
        config.validate()?;
        let pool = SessionPool::new(&config, communicator);
        tracing::info!(
            ledger = %config.ledger_name,
            max_concurrent_transactions = config.max_concurrent_transactions,
            retry_limit = config.retry_policy.retry_limit(),
            "ledger driver created",
        );
        Ok(Self {
            config,
            pool,
            codec,
            stats: RwLock::new(DriverStats::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Runs `body` in a transaction with the default retry policy.
    ///
    /// The body may run more than once and must tolerate re-execution.
    pub fn execute<R, F>(&self, body: F) -> DriverResult<R>
    where
        F: FnMut(&mut ExecutionContext<'_, K>) -> DriverResult<R>,
    {
        self.execute_with_retry_policy(&self.config.retry_policy, body)
    }

    /// Runs `body` in a transaction with the given retry policy.
    pub fn execute_with_retry_policy<R, F>(&self, policy: &RetryPolicy, body: F) -> DriverResult<R>
    where
        F: FnMut(&mut ExecutionContext<'_, K>) -> DriverResult<R>,
    {
        if self.is_closed() {
            return Err(DriverError::DriverClosed);
        }
        TransactionExecutor::new(&self.pool, &self.codec, &self.stats).run(policy, body)
    }

    /// Runs a single statement in its own transaction and buffers the results.
    #[tracing::instrument(skip(self, parameters), fields(ledger = %self.config.ledger_name))]
    pub fn execute_statement(
        &self,
        statement: &str,
        parameters: &[WireValue],
    ) -> DriverResult<BufferedCursor> {
        self.execute(|tx| tx.execute_statement(statement, parameters)?.buffer())
    }

    /// Names of the active tables in the ledger.
    #[tracing::instrument(skip(self), fields(ledger = %self.config.ledger_name))]
    pub fn list_tables(&self) -> DriverResult<Vec<String>> {
        let cursor = self.execute_statement(LIST_TABLES_STATEMENT, &[])?;
        cursor.decode_all(&self.codec)
    }

    /// Closes the driver and its pool. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(ledger = %self.config.ledger_name, "closing ledger driver");
        self.pool.close();
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Name of the ledger.
    pub fn ledger_name(&self) -> &str {
        &self.config.ledger_name
    }

    /// The configuration the driver was built with.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Default retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry_policy
    }

    /// The codec.
    pub fn codec(&self) -> &K {
        &self.codec
    }

    /// Session pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Transaction counters.
    pub fn stats(&self) -> DriverStats {
        self.stats.read().clone()
    }
}

impl<K: Codec> Drop for LedgerDriver<K> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<K: Codec> fmt::Debug for LedgerDriver<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerDriver")
            .field("ledger_name", &self.config.ledger_name)
            .field("pool", &self.pool)
            .field("closed", &self.is_closed())
            .finish()
    }
}
