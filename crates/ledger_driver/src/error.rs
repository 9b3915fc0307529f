//! Error types for the ledger driver.

use crate::types::TransactionId;
use ledger_codec::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Boxed application error raised from inside a transaction body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How the transaction executor reacts to an error.
///
/// Classification is a property of the error itself; retry policies only
/// decide how long to wait and when to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Optimistic-concurrency conflict. Always retryable; the session stays healthy.
    Conflict,
    /// The session is stale or broken. Retryable on a fresh session.
    InvalidSession,
    /// Transient transport or service failure. Retryable.
    Transient,
    /// Not retryable.
    Fatal,
}

impl ErrorClass {
    /// Returns true if an attempt failing with this class may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Fatal)
    }
}

/// Errors that can occur while running transactions against a ledger.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The transaction's read snapshot was invalidated by a concurrent commit.
    #[error("occ conflict: {message}")]
    OccConflict {
        /// Message reported by the service.
        message: String,
    },

    /// The session is no longer valid on the service side.
    #[error("invalid session: {message}")]
    InvalidSession {
        /// Message reported by the service.
        message: String,
    },

    /// The transaction is too old to continue.
    #[error("transaction expired: {message}")]
    TransactionExpired {
        /// Message reported by the service.
        message: String,
    },

    /// The request was malformed (bad statement, unknown table, ...).
    #[error("bad request: {message}")]
    BadRequest {
        /// Message reported by the service.
        message: String,
    },

    /// The caller is not authorized for the requested operation.
    #[error("access denied: {message}")]
    AccessDenied {
        /// Message reported by the service.
        message: String,
    },

    /// The service is throttling requests.
    #[error("capacity exceeded: {message}")]
    CapacityExceeded {
        /// Message reported by the service.
        message: String,
    },

    /// Generic service-side failure with its status code.
    #[error("service error (status {status}): {message}")]
    Service {
        /// Status code reported by the service.
        status: u16,
        /// Message reported by the service.
        message: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A request timed out.
    #[error("operation timed out")]
    Timeout,

    /// Codec error while encoding parameters or decoding results.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The digest returned on commit does not match the locally computed one.
    #[error("commit digest mismatch for transaction {transaction_id}")]
    CommitDigestMismatch {
        /// Transaction whose digest did not match.
        transaction_id: TransactionId,
    },

    /// The transaction body asked for the transaction to be aborted.
    #[error("transaction aborted by the transaction body")]
    Aborted,

    /// Error raised by application code inside the transaction body.
    #[error("application error: {0}")]
    Application(#[source] BoxError),

    /// Invalid transaction state transition.
    #[error("invalid transaction state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Invalid driver configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        message: String,
    },

    /// No session became available within the acquire timeout.
    #[error("session pool exhausted: no session available after waiting {timeout:?}")]
    PoolTimeout {
        /// How long the caller waited.
        timeout: Duration,
    },

    /// Starting a new session kept failing.
    #[error("failed to start a session after {attempts} attempts: {source}")]
    PoolExhausted {
        /// Number of session creation attempts made.
        attempts: u32,
        /// Error from the last attempt.
        source: Box<DriverError>,
    },

    /// The driver has been closed.
    #[error("driver is closed")]
    DriverClosed,

    /// A transaction failed with a non-retryable error.
    #[error("transaction failed after {attempts} attempt(s) (transaction {}): {source}", display_id(.transaction_id))]
    TransactionFailed {
        /// Number of attempts made, including the failing one.
        attempts: u32,
        /// Transaction id of the failing attempt, if one was started.
        transaction_id: Option<TransactionId>,
        /// The underlying error.
        source: Box<DriverError>,
    },

    /// A transaction kept failing with retryable errors until the retry limit.
    #[error("retries exhausted after {attempts} attempt(s) (transaction {}): {source}", display_id(.transaction_id))]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Transaction id of the last attempt, if one was started.
        transaction_id: Option<TransactionId>,
        /// The last retryable error.
        source: Box<DriverError>,
    },
}

fn display_id(id: &Option<TransactionId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "<none>".into(),
    }
}

impl DriverError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an OCC conflict error.
    pub fn occ_conflict(message: impl Into<String>) -> Self {
        Self::OccConflict {
            message: message.into(),
        }
    }

    /// Creates an invalid session error.
    pub fn invalid_session(message: impl Into<String>) -> Self {
        Self::InvalidSession {
            message: message.into(),
        }
    }

    /// Creates a transaction expired error.
    pub fn transaction_expired(message: impl Into<String>) -> Self {
        Self::TransactionExpired {
            message: message.into(),
        }
    }

    /// Creates a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates an access denied error.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Wraps an application error raised inside a transaction body.
    pub fn application<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Application(error.into())
    }

    /// Classifies this error for the retry loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            DriverError::OccConflict { .. } => ErrorClass::Conflict,
            DriverError::InvalidSession { .. } => ErrorClass::InvalidSession,
            DriverError::Transport { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            DriverError::Timeout | DriverError::CapacityExceeded { .. } => ErrorClass::Transient,
            DriverError::Service { status, .. } => match status {
                500 | 503 => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
            DriverError::TransactionExpired { .. }
            | DriverError::BadRequest { .. }
            | DriverError::AccessDenied { .. }
            | DriverError::Codec(_)
            | DriverError::CommitDigestMismatch { .. }
            | DriverError::Aborted
            | DriverError::Application(_)
            | DriverError::InvalidStateTransition { .. }
            | DriverError::InvalidConfig { .. }
            | DriverError::PoolTimeout { .. }
            | DriverError::PoolExhausted { .. }
            | DriverError::DriverClosed
            | DriverError::TransactionFailed { .. }
            | DriverError::RetriesExhausted { .. } => ErrorClass::Fatal,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Returns true for errors raised by the session pool.
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            DriverError::PoolTimeout { .. }
                | DriverError::PoolExhausted { .. }
                | DriverError::DriverClosed
        )
    }

    /// Number of attempts recorded by a terminal transaction error.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            DriverError::TransactionFailed { attempts, .. }
            | DriverError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Transaction id recorded by a terminal transaction error.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            DriverError::TransactionFailed { transaction_id, .. }
            | DriverError::RetriesExhausted { transaction_id, .. } => transaction_id.as_ref(),
            DriverError::CommitDigestMismatch { transaction_id } => Some(transaction_id),
            _ => None,
        }
    }

    /// Returns the innermost error, looking through the diagnostic wrappers.
    pub fn root_cause(&self) -> &DriverError {
        match self {
            DriverError::TransactionFailed { source, .. }
            | DriverError::RetriesExhausted { source, .. }
            | DriverError::PoolExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
