//! Property-based test generators using proptest.
//!
//! Provides strategies for generating driver inputs and failure scripts.

use crate::fixtures::Account;
use crate::ledger::{Fault, FaultPoint};
use ledger_driver::DriverError;
use proptest::prelude::*;
use std::time::Duration;

/// Strategy for valid table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for document keys.
pub fn document_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9-]{1,24}").expect("Invalid regex")
}

/// Strategy for account documents.
pub fn account_strategy() -> impl Strategy<Value = Account> {
    (
        prop::string::string_regex("[A-Z][a-z]{1,10}").expect("Invalid regex"),
        -1_000_000i64..1_000_000,
    )
        .prop_map(|(owner, balance)| Account::new(owner, balance))
}

/// Strategy for retry limits small enough to run quickly.
pub fn retry_limit_strategy() -> impl Strategy<Value = u32> {
    0u32..6
}

/// Strategy for faults the driver retries.
pub fn retryable_fault_strategy() -> impl Strategy<Value = Fault> {
    prop_oneof![
        Just(Fault::OccConflict),
        Just(Fault::InvalidSession),
        Just(Fault::ConnectionReset),
        Just(Fault::Timeout),
        Just(Fault::CapacityExceeded),
        Just(Fault::ServiceUnavailable),
    ]
}

/// Strategy for faults the driver does not retry.
pub fn fatal_fault_strategy() -> impl Strategy<Value = Fault> {
    prop_oneof![Just(Fault::BadRequest), Just(Fault::AccessDenied)]
}

/// Strategy for points inside a transaction attempt.
pub fn attempt_fault_point_strategy() -> impl Strategy<Value = FaultPoint> {
    prop_oneof![
        Just(FaultPoint::StartTransaction),
        Just(FaultPoint::ExecuteStatement),
        Just(FaultPoint::Commit),
    ]
}

/// Strategy for retryable driver errors.
pub fn retryable_error_strategy() -> impl Strategy<Value = DriverError> {
    retryable_fault_strategy().prop_map(Fault::to_error)
}

/// Strategy for custom backoff delays, in milliseconds per attempt.
pub fn backoff_schedule_strategy(max_attempts: usize) -> impl Strategy<Value = Vec<Duration>> {
    prop::collection::vec((0u64..5).prop_map(Duration::from_millis), max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_table_names_are_single_words(name in table_name_strategy()) {
            prop_assert!(!name.is_empty());
            prop_assert!(!name.contains(char::is_whitespace));
        }

        #[test]
        fn test_retryable_errors_are_retryable(error in retryable_error_strategy()) {
            prop_assert!(error.is_retryable());
        }

        #[test]
        fn test_fatal_faults_are_not_retryable(fault in fatal_fault_strategy()) {
            prop_assert!(!fault.to_error().is_retryable());
        }

        #[test]
        fn test_backoff_schedule_length(schedule in backoff_schedule_strategy(4)) {
            prop_assert_eq!(schedule.len(), 4);
        }
    }
}
