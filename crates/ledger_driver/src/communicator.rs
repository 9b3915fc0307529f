//! Communication layer abstraction.

use crate::digest::CommitDigest;
use crate::error::DriverResult;
use crate::types::{Page, PageToken, SessionToken, TransactionId};
use ledger_codec::WireValue;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A communicator sends session commands to the ledger service.
///
/// This trait abstracts the wire protocol, allowing for different
/// implementations (HTTP, an in-memory service, a scripted mock for
/// testing, etc.). Implementations map the service's error codes onto
/// [`DriverError`](crate::DriverError) variants; the transaction executor
/// relies on that mapping to decide what to retry.
pub trait Communicator: Send + Sync {
    /// Starts a new session on the given ledger.
    fn start_session(&self, ledger_name: &str) -> DriverResult<SessionToken>;

    /// Starts a transaction on the session.
    fn start_transaction(&self, session: &SessionToken) -> DriverResult<TransactionId>;

    /// Executes a statement and returns the first page of results.
    fn execute_statement(
        &self,
        session: &SessionToken,
        transaction_id: &TransactionId,
        statement: &str,
        parameters: &[WireValue],
    ) -> DriverResult<Page>;

    /// Fetches a subsequent page of results.
    fn fetch_page(
        &self,
        session: &SessionToken,
        transaction_id: &TransactionId,
        token: &PageToken,
    ) -> DriverResult<Page>;

    /// Commits the transaction and returns the service's commit digest.
    fn commit(
        &self,
        session: &SessionToken,
        transaction_id: &TransactionId,
        digest: &CommitDigest,
    ) -> DriverResult<CommitDigest>;

    /// Aborts the transaction.
    fn abort(&self, session: &SessionToken, transaction_id: &TransactionId) -> DriverResult<()>;

    /// Ends the session.
    fn end_session(&self, session: &SessionToken) -> DriverResult<()>;
}

/// Operations of a [`Communicator`], used to script the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// `start_session`
    StartSession,
    /// `start_transaction`
    StartTransaction,
    /// `execute_statement`
    ExecuteStatement,
    /// `fetch_page`
    FetchPage,
    /// `commit`
    Commit,
    /// `abort`
    Abort,
    /// `end_session`
    EndSession,
}

/// A scripted communicator for testing.
///
/// Every call succeeds unless a failure was queued for its operation.
/// `execute_statement` returns queued pages in order (an empty page when
/// none are queued), `fetch_page` looks continuation pages up by token, and
/// `commit` echoes the client's digest unless an override is set.
#[derive(Debug, Default)]
pub struct MockCommunicator {
    next_id: AtomicU64,
    failures: Mutex<HashMap<MockOperation, VecDeque<crate::DriverError>>>,
    pages: Mutex<VecDeque<Page>>,
    continuations: Mutex<HashMap<PageToken, Page>>,
    commit_digest: Mutex<Option<CommitDigest>>,
    calls: Mutex<HashMap<MockOperation, usize>>,
    statements: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
}

impl MockCommunicator {
    /// Creates a new mock communicator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `operation` fail with `error`.
    ///
    /// Failures queue up: calling this twice fails the next two calls.
    pub fn fail_next(&self, operation: MockOperation, error: crate::DriverError) {
        self.failures
            .lock()
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Queues a page to be returned by the next `execute_statement`.
    pub fn push_page(&self, page: Page) {
        self.pages.lock().push_back(page);
    }

    /// Registers the page returned by `fetch_page` for `token`.
    pub fn add_continuation(&self, token: PageToken, page: Page) {
        self.continuations.lock().insert(token, page);
    }

    /// Makes `commit` return this digest instead of echoing the client's.
    pub fn set_commit_digest(&self, digest: CommitDigest) {
        *self.commit_digest.lock() = Some(digest);
    }

    /// Adds a delay to every `execute_statement` call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of calls made for `operation`.
    pub fn call_count(&self, operation: MockOperation) -> usize {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    /// Statements executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    fn record(&self, operation: MockOperation) -> DriverResult<()> {
        *self.calls.lock().entry(operation).or_default() += 1;
        match self
            .failures
            .lock()
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Communicator for MockCommunicator {
    fn start_session(&self, _ledger_name: &str) -> DriverResult<SessionToken> {
        self.record(MockOperation::StartSession)?;
        Ok(SessionToken::new(format!("session-{}", self.next_id())))
    }

    fn start_transaction(&self, _session: &SessionToken) -> DriverResult<TransactionId> {
        self.record(MockOperation::StartTransaction)?;
        Ok(TransactionId::new(format!("txn-{}", self.next_id())))
    }

    fn execute_statement(
        &self,
        _session: &SessionToken,
        _transaction_id: &TransactionId,
        statement: &str,
        _parameters: &[WireValue],
    ) -> DriverResult<Page> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        self.record(MockOperation::ExecuteStatement)?;
        self.statements.lock().push(statement.to_string());
        Ok(self.pages.lock().pop_front().unwrap_or_default())
    }

    fn fetch_page(
        &self,
        _session: &SessionToken,
        _transaction_id: &TransactionId,
        token: &PageToken,
    ) -> DriverResult<Page> {
        self.record(MockOperation::FetchPage)?;
        self.continuations.lock().remove(token).ok_or_else(|| {
            crate::DriverError::bad_request(format!("unknown page token {}", token.as_str()))
        })
    }

    fn commit(
        &self,
        _session: &SessionToken,
        _transaction_id: &TransactionId,
        digest: &CommitDigest,
    ) -> DriverResult<CommitDigest> {
        self.record(MockOperation::Commit)?;
        Ok(self.commit_digest.lock().unwrap_or(*digest))
    }

    fn abort(&self, _session: &SessionToken, _transaction_id: &TransactionId) -> DriverResult<()> {
        self.record(MockOperation::Abort)
    }

    fn end_session(&self, _session: &SessionToken) -> DriverResult<()> {
        self.record(MockOperation::EndSession)
    }
}
