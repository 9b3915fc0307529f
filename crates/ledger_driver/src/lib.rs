//! # Ledger Driver
//!
//! Client-side transaction engine for a remote ledger database.
//!
//! This crate provides:
//! - A bounded [`SessionPool`] of reusable sessions
//! - A [`RetryPolicy`] with equal-jitter exponential backoff
//! - A transaction executor that re-runs an idempotent body on OCC
//!   conflicts, invalid sessions, and transient failures
//! - Paginated ([`StreamCursor`]) and buffered ([`BufferedCursor`]) results
//! - Commit digest verification ([`CommitDigest`])
//! - The [`Communicator`] trait abstracting the service protocol, with a
//!   scripted [`MockCommunicator`] for tests
//!
//! ## Usage
//!
//! ```
//! use ledger_driver::{Communicator, DriverConfig, LedgerDriver, MockCommunicator};
//! use std::sync::Arc;
//!
//! let communicator: Arc<dyn Communicator> = Arc::new(MockCommunicator::new());
//! let driver = LedgerDriver::new(DriverConfig::new("vehicle-registration"), communicator).unwrap();
//!
//! let inserted = driver
//!     .execute(|tx| {
//!         tx.execute_statement_with("INSERT INTO cars ?, ?", &["VIN-1", "red"])?;
//!         Ok(1)
//!     })
//!     .unwrap();
//! assert_eq!(inserted, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod communicator;
mod config;
mod cursor;
mod digest;
mod driver;
mod error;
mod executor;
mod pool;
mod retry;
mod session;
mod transaction;
mod types;

pub use communicator::{Communicator, MockCommunicator, MockOperation};
pub use config::{
    DriverConfig, DEFAULT_MAX_CONCURRENT_TRANSACTIONS, DEFAULT_POOL_ACQUIRE_TIMEOUT,
    DEFAULT_SESSION_CREATION_ATTEMPTS,
};
pub use cursor::{BufferedCursor, StatementStats, StreamCursor};
pub use digest::{CommitDigest, DIGEST_SIZE};
pub use driver::{LedgerDriver, LIST_TABLES_STATEMENT};
pub use error::{BoxError, DriverError, DriverResult, ErrorClass};
pub use executor::{DriverStats, ExecutorState};
pub use pool::{PoolStats, SessionLease, SessionPool};
pub use retry::{BackoffFn, RetryPolicy, DEFAULT_BASE, DEFAULT_MAX_BACKOFF, DEFAULT_RETRY_LIMIT};
pub use session::Session;
pub use transaction::{ExecutionContext, Transaction, TransactionState};
pub use types::{IoUsage, Page, PageToken, SessionToken, TimingInformation, TransactionId};

pub use ledger_codec::{CborCodec, Codec, CodecError, WireValue};
