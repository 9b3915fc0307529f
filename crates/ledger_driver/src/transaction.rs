//! Transactions and the context handed to transaction bodies.
//!
//! A [`Transaction`] lives for exactly one attempt. It tracks its state and
//! the running [`CommitDigest`] of every statement sent on it. Bodies never
//! see the transaction directly: they get an [`ExecutionContext`] by `&mut`
//! borrow, so neither the context nor the cursors it produces can outlive
//! the attempt.

use crate::cursor::StreamCursor;
use crate::digest::CommitDigest;
use crate::error::{DriverError, DriverResult};
use crate::session::Session;
use crate::types::TransactionId;
use ledger_codec::{Codec, WireValue};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Started on the service, no statement sent yet.
    Started,
    /// At least one statement was sent.
    Executing,
    /// Commit was sent and no answer has been processed yet.
    CommitRequested,
    /// Committed.
    Committed,
    /// Aborted, either explicitly or by the service.
    Aborted,
}

impl TransactionState {
    /// Returns true for `Committed` and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }

    fn can_transition_to(&self, to: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, to),
            (Started, Executing)
                | (Started, CommitRequested)
                | (Started, Aborted)
                | (Executing, Executing)
                | (Executing, CommitRequested)
                | (Executing, Aborted)
                | (CommitRequested, Committed)
                | (CommitRequested, Aborted)
        )
    }
}

/// One attempt's transaction on a session.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    digest: CommitDigest,
    statement_count: usize,
    read_ahead: usize,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId) -> Self {
        let digest = CommitDigest::seed(&id);
        Self {
            id,
            state: TransactionState::Started,
            digest,
            statement_count: 0,
            read_ahead: 0,
        }
    }

    pub(crate) fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    /// Service-assigned id.
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Running digest of the statements sent so far.
    pub fn digest(&self) -> &CommitDigest {
        &self.digest
    }

    /// Number of statements sent.
    pub fn statement_count(&self) -> usize {
        self.statement_count
    }

    fn transition(&mut self, to: TransactionState) -> DriverResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(DriverError::InvalidStateTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", to),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Sends a statement and returns a cursor over its results.
    pub(crate) fn execute_statement<'s>(
        &mut self,
        session: &'s Session,
        statement: &str,
        parameters: &[WireValue],
    ) -> DriverResult<StreamCursor<'s>> {
        self.transition(TransactionState::Executing)?;
        self.digest.update(statement, parameters);
        self.statement_count += 1;

        let page = session.communicator().execute_statement(
            session.token(),
            &self.id,
            statement,
            parameters,
        )?;
        Ok(StreamCursor::with_read_ahead(
            session,
            self.id.clone(),
            page,
            self.read_ahead,
        ))
    }

    /// Commits, verifying the digest returned by the service.
    ///
    /// On a digest mismatch the service has committed, so the transaction
    /// ends up `Committed` and the error is still returned.
    pub(crate) fn commit(&mut self, session: &Session) -> DriverResult<()> {
        self.transition(TransactionState::CommitRequested)?;
        let returned = session
            .communicator()
            .commit(session.token(), &self.id, &self.digest)?;
        self.transition(TransactionState::Committed)?;

        if returned != self.digest {
            return Err(DriverError::CommitDigestMismatch {
                transaction_id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Sends an abort to the service.
    pub(crate) fn abort(&mut self, session: &Session) -> DriverResult<()> {
        self.transition(TransactionState::Aborted)?;
        session.communicator().abort(session.token(), &self.id)
    }

    /// Records that the service already closed the transaction.
    pub(crate) fn mark_aborted(&mut self) {
        if !self.state.is_terminal() {
            self.state = TransactionState::Aborted;
        }
    }
}

/// Handle given to a transaction body for one attempt.
///
/// ```ignore
/// let balance: u64 = driver.execute(|tx| {
///     let row = tx
///         .execute_statement_with("SELECT * FROM accounts WHERE id = ?", &["alice"])?
///         .buffer()?;
///     match row.values().first() {
///         Some(value) => tx.decode(value),
///         None => tx.abort(),
///     }
/// })?;
/// ```
pub struct ExecutionContext<'t, K: Codec> {
    session: &'t Session,
    transaction: &'t mut Transaction,
    codec: &'t K,
}

impl<'t, K: Codec> ExecutionContext<'t, K> {
    pub(crate) fn new(
        session: &'t Session,
        transaction: &'t mut Transaction,
        codec: &'t K,
    ) -> Self {
        Self {
            session,
            transaction,
            codec,
        }
    }

    /// Id of the transaction of this attempt.
    pub fn transaction_id(&self) -> &TransactionId {
        self.transaction.id()
    }

    /// The codec used for parameters and results.
    pub fn codec(&self) -> &K {
        self.codec
    }

    /// Executes a statement with already encoded parameters.
    pub fn execute_statement(
        &mut self,
        statement: &str,
        parameters: &[WireValue],
    ) -> DriverResult<StreamCursor<'t>> {
        let session = self.session;
        self.transaction
            .execute_statement(session, statement, parameters)
    }

    /// Encodes `parameters` with the codec, then executes the statement.
    pub fn execute_statement_with<P: Serialize>(
        &mut self,
        statement: &str,
        parameters: &[P],
    ) -> DriverResult<StreamCursor<'t>> {
        let encoded = parameters
            .iter()
            .map(|p| self.encode(p))
            .collect::<DriverResult<Vec<_>>>()?;
        self.execute_statement(statement, &encoded)
    }

    /// Encodes a value with the codec.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> DriverResult<WireValue> {
        Ok(self.codec.encode(value)?)
    }

    /// Decodes a value with the codec.
    pub fn decode<T: DeserializeOwned>(&self, value: &WireValue) -> DriverResult<T> {
        Ok(self.codec.decode(value)?)
    }

    /// Abandons the attempt.
    ///
    /// Return the result from the body; the executor aborts the transaction
    /// and fails the call with [`DriverError::Aborted`] without retrying.
    pub fn abort<T>(&mut self) -> DriverResult<T> {
        tracing::debug!(transaction_id = %self.transaction.id(), "transaction body requested abort");
        Err(DriverError::Aborted)
    }
}
