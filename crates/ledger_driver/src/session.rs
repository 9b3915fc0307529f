//! Sessions: one logical connection to the ledger.

use crate::communicator::Communicator;
use crate::error::DriverResult;
use crate::transaction::Transaction;
use crate::types::SessionToken;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A session on the ledger service.
///
/// A session runs at most one transaction at a time. Once the service
/// reports it as invalid, or a cleanup request on it fails, it is marked
/// dead and is never reused: the pool ends and drops it on release.
pub struct Session {
    id: u64,
    token: SessionToken,
    communicator: Arc<dyn Communicator>,
    alive: AtomicBool,
    read_ahead: usize,
}

impl Session {
    /// Starts a new session on the service.
    pub(crate) fn start(
        id: u64,
        ledger_name: &str,
        communicator: Arc<dyn Communicator>,
    ) -> DriverResult<Self> {
        let token = communicator.start_session(ledger_name)?;
        Ok(Self {
            id,
            token,
            communicator,
            alive: AtomicBool::new(true),
            read_ahead: 0,
        })
    }

    /// Sets how many result pages cursors of this session prefetch.
    pub(crate) fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    /// Result pages prefetched per cursor; `0` means on demand.
    pub fn read_ahead(&self) -> usize {
        self.read_ahead
    }

    /// Driver-local session number, unique per pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Service-issued session token.
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Returns true until the session has been invalidated or ended.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Marks the session as unusable.
    pub(crate) fn invalidate(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            tracing::debug!(session_id = self.id, "session invalidated");
        }
    }

    pub(crate) fn communicator(&self) -> &dyn Communicator {
        self.communicator.as_ref()
    }

    pub(crate) fn shared_communicator(&self) -> Arc<dyn Communicator> {
        Arc::clone(&self.communicator)
    }

    /// Starts a transaction on this session.
    pub(crate) fn start_transaction(&self) -> DriverResult<Transaction> {
        let id = self.communicator.start_transaction(&self.token)?;
        tracing::trace!(session_id = self.id, transaction_id = %id, "transaction started");
        Ok(Transaction::new(id).with_read_ahead(self.read_ahead))
    }

    /// Aborts the transaction, invalidating the session if that fails.
    pub(crate) fn abort_quietly(&self, transaction: &mut Transaction) {
        if transaction.state().is_terminal() {
            return;
        }
        if let Err(e) = transaction.abort(self) {
            tracing::warn!(
                session_id = self.id,
                transaction_id = %transaction.id(),
                error = %e,
                "ignored error aborting transaction; discarding session",
            );
            self.invalidate();
        }
    }

    /// Ends the session on the service. Errors are logged and ignored.
    pub(crate) fn end(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.communicator.end_session(&self.token) {
            tracing::warn!(session_id = self.id, error = %e, "error ending session");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("alive", &self.is_alive())
            .field("read_ahead", &self.read_ahead)
            .finish()
    }
}
