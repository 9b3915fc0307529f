//! The transaction retry loop.
//!
//! Each attempt leases a session, starts a transaction, runs the body,
//! and commits. A failed attempt is classified by its error:
//!
//! - OCC conflicts leave the session healthy and send no abort, the
//!   service has already closed the transaction
//! - invalid-session errors invalidate the session so the pool drops it
//! - everything else gets a best-effort abort; a failed abort invalidates
//!   the session
//!
//! The lease is always released before sleeping for the backoff delay.

use crate::error::{DriverError, DriverResult, ErrorClass};
use crate::pool::SessionPool;
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::transaction::{ExecutionContext, Transaction};
use crate::types::TransactionId;
use ledger_codec::Codec;
use parking_lot::RwLock;
use std::fmt;

/// Phases of the executor loop, as reported in trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Waiting for a session lease.
    Acquiring,
    /// Starting the transaction.
    Beginning,
    /// Running the transaction body.
    RunningBody,
    /// Committing.
    Committing,
    /// Waiting for the backoff delay before the next attempt.
    Retrying,
    /// Committed.
    Done,
    /// Gave up.
    Failed,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorState::Acquiring => "acquiring",
            ExecutorState::Beginning => "beginning",
            ExecutorState::RunningBody => "running_body",
            ExecutorState::Committing => "committing",
            ExecutorState::Retrying => "retrying",
            ExecutorState::Done => "done",
            ExecutorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Driver-wide transaction counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Transactions that committed.
    pub transactions_committed: u64,
    /// Transactions that ended in an error.
    pub transactions_failed: u64,
    /// Retries performed across all transactions.
    pub retries: u64,
    /// Rendering of the most recent terminal error.
    pub last_error: Option<String>,
}

struct AttemptFailure {
    error: DriverError,
    transaction_id: Option<TransactionId>,
}

/// Runs transaction bodies with retries.
pub(crate) struct TransactionExecutor<'d, K: Codec> {
    pool: &'d SessionPool,
    codec: &'d K,
    stats: &'d RwLock<DriverStats>,
}

impl<'d, K: Codec> TransactionExecutor<'d, K> {
    pub(crate) fn new(pool: &'d SessionPool, codec: &'d K, stats: &'d RwLock<DriverStats>) -> Self {
        Self { pool, codec, stats }
    }

    #[tracing::instrument(
        name = "transaction",
        skip_all,
        fields(ledger = %self.pool.ledger_name(), retry_limit = policy.retry_limit())
    )]
    pub(crate) fn run<R, F>(&self, policy: &RetryPolicy, mut body: F) -> DriverResult<R>
    where
        F: FnMut(&mut ExecutionContext<'_, K>) -> DriverResult<R>,
    {
        let mut attempt: u32 = 0;
        loop {
            trace_state(ExecutorState::Acquiring, attempt);
            let lease = match self.pool.acquire() {
                Ok(lease) => lease,
                Err(e) => {
                    self.record_failure(&e);
                    return Err(e);
                }
            };

            let failure = match self.attempt(&lease, attempt, &mut body) {
                Ok(value) => {
                    lease.release(true);
                    trace_state(ExecutorState::Done, attempt);
                    if attempt > 0 {
                        tracing::debug!(attempts = attempt + 1, "transaction committed after retry");
                    }
                    self.stats.write().transactions_committed += 1;
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let valid = lease.is_alive();
            lease.release(valid);

            let AttemptFailure {
                error,
                transaction_id,
            } = failure;

            if !error.is_retryable() {
                trace_state(ExecutorState::Failed, attempt);
                tracing::debug!(
                    attempt,
                    transaction_id = ?transaction_id,
                    error = %error,
                    "transaction failed with non-retryable error",
                );
                let err = DriverError::TransactionFailed {
                    attempts: attempt + 1,
                    transaction_id,
                    source: Box::new(error),
                };
                self.record_failure(&err);
                return Err(err);
            }

            if !policy.should_retry(attempt, &error) {
                trace_state(ExecutorState::Failed, attempt);
                tracing::warn!(
                    attempts = attempt + 1,
                    transaction_id = ?transaction_id,
                    error = %error,
                    "retry limit reached",
                );
                let err = DriverError::RetriesExhausted {
                    attempts: attempt + 1,
                    transaction_id,
                    source: Box::new(error),
                };
                self.record_failure(&err);
                return Err(err);
            }

            let delay = policy.backoff_delay(attempt, &error, transaction_id.as_ref());
            trace_state(ExecutorState::Retrying, attempt);
            tracing::debug!(
                attempt,
                transaction_id = ?transaction_id,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying transaction after backoff",
            );
            self.stats.write().retries += 1;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            attempt += 1;
        }
    }

    fn attempt<R, F>(&self, session: &Session, attempt: u32, body: &mut F) -> Result<R, AttemptFailure>
    where
        F: FnMut(&mut ExecutionContext<'_, K>) -> DriverResult<R>,
    {
        trace_state(ExecutorState::Beginning, attempt);
        let mut transaction = match session.start_transaction() {
            Ok(transaction) => transaction,
            Err(error) => {
                // Nothing to abort yet.
                if error.class() == ErrorClass::InvalidSession {
                    session.invalidate();
                }
                return Err(AttemptFailure {
                    error,
                    transaction_id: None,
                });
            }
        };

        match self.run_body_and_commit(session, &mut transaction, attempt, body) {
            Ok(value) => Ok(value),
            Err(error) => {
                dispose(session, &mut transaction, &error);
                Err(AttemptFailure {
                    error,
                    transaction_id: Some(transaction.id().clone()),
                })
            }
        }
    }

    fn run_body_and_commit<R, F>(
        &self,
        session: &Session,
        transaction: &mut Transaction,
        attempt: u32,
        body: &mut F,
    ) -> DriverResult<R>
    where
        F: FnMut(&mut ExecutionContext<'_, K>) -> DriverResult<R>,
    {
        trace_state(ExecutorState::RunningBody, attempt);
        let value = {
            let mut context = ExecutionContext::new(session, transaction, self.codec);
            body(&mut context)?
        };

        trace_state(ExecutorState::Committing, attempt);
        transaction.commit(session)?;
        Ok(value)
    }

    fn record_failure(&self, error: &DriverError) {
        let mut stats = self.stats.write();
        stats.transactions_failed += 1;
        stats.last_error = Some(error.to_string());
    }
}

/// Cleans up after a failed attempt according to the error's class.
fn dispose(session: &Session, transaction: &mut Transaction, error: &DriverError) {
    match error.class() {
        ErrorClass::Conflict => transaction.mark_aborted(),
        ErrorClass::InvalidSession => {
            session.invalidate();
            transaction.mark_aborted();
        }
        ErrorClass::Transient | ErrorClass::Fatal => session.abort_quietly(transaction),
    }
}

fn trace_state(state: ExecutorState, attempt: u32) {
    tracing::trace!(state = %state, attempt, "executor state");
}
