//! # Ledger Testkit
//!
//! Test utilities for the ledger driver.
//!
//! This crate provides:
//! - [`InMemoryLedger`], a ledger service with OCC, pagination, commit
//!   digest verification, and fault injection
//! - Test fixtures wiring a driver to an in-memory ledger
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust
//! use ledger_testkit::prelude::*;
//!
//! let test = TestLedger::new();
//! test.ledger.inject(FaultPoint::Commit, Fault::OccConflict);
//!
//! let id = test
//!     .execute(|tx| {
//!         tx.execute_statement("CREATE TABLE cars", &[])?;
//!         Ok(tx.transaction_id().clone())
//!     })
//!     .unwrap();
//! assert!(!id.as_str().is_empty());
//! assert_eq!(test.driver.stats().retries, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod ledger;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::ledger::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use ledger::*;
pub use stress::*;
