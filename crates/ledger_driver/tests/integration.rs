//! Integration tests running the driver against the in-memory ledger.

use ledger_driver::{
    Codec, Communicator, DriverConfig, DriverError, ErrorClass, LedgerDriver, RetryPolicy,
    StatementStats, TransactionId,
};
use ledger_testkit::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn recording_policy(
    retry_limit: u32,
    delay: Duration,
) -> (RetryPolicy, Arc<Mutex<Vec<(u32, ErrorClass, Option<TransactionId>)>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&calls);
    let policy = RetryPolicy::new(retry_limit).with_custom_backoff(move |attempt, error, id| {
        recorder.lock().push((attempt, error.class(), id.cloned()));
        delay
    });
    (policy, calls)
}

#[test]
fn occ_conflicts_on_two_attempts_then_success() {
    let test = TestLedger::new();
    test.ledger.create_table("cars");
    test.ledger
        .inject_times(FaultPoint::Commit, Fault::OccConflict, 2);

    let (policy, backoffs) = recording_policy(4, Duration::from_millis(1));
    let mut attempts = 0u32;
    let result = test
        .execute_with_retry_policy(&policy, |tx| {
            attempts += 1;
            tx.execute_statement_with("INSERT INTO cars ?, ?", &["vin-1", "red"])?;
            Ok(attempts)
        })
        .unwrap();

    assert_eq!(result, 3);
    let backoffs = backoffs.lock();
    assert_eq!(backoffs.len(), 2);
    assert_eq!(backoffs[0].0, 0);
    assert_eq!(backoffs[1].0, 1);
    assert!(backoffs.iter().all(|(_, class, id)| *class == ErrorClass::Conflict && id.is_some()));
    assert_eq!(test.ledger.document_count("cars"), 1);
    assert_eq!(test.ledger.stats().transactions_aborted, 0);
}

#[test]
fn always_retryable_body_runs_limit_plus_one_times() {
    for retry_limit in 0..4u32 {
        let test = TestLedger::new();
        test.ledger
            .inject_times(FaultPoint::ExecuteStatement, Fault::Timeout, 100);

        let mut attempts = 0u32;
        let err = test
            .execute_with_retry_policy(&instant_retry_policy(retry_limit), |tx| {
                attempts += 1;
                tx.execute_statement("CREATE TABLE t", &[])?;
                Ok(())
            })
            .unwrap_err();

        assert_eq!(attempts, retry_limit + 1);
        assert_eq!(err.attempts(), Some(retry_limit + 1));
        assert!(matches!(err, DriverError::RetriesExhausted { .. }));
        assert!(matches!(err.root_cause(), DriverError::Timeout));
    }
}

#[test]
fn non_retryable_error_on_first_attempt() {
    let test = TestLedger::new();
    let mut attempts = 0;
    let err = test
        .execute(|tx| {
            attempts += 1;
            // Unknown table.
            tx.execute_statement("SELECT * FROM missing", &[])?;
            Ok(())
        })
        .unwrap_err();

    assert_eq!(attempts, 1);
    assert!(matches!(err, DriverError::TransactionFailed { attempts: 1, .. }));
    assert!(matches!(err.root_cause(), DriverError::BadRequest { .. }));
    assert!(err.transaction_id().is_some());
    assert_eq!(test.ledger.stats().transactions_aborted, 1);
}

#[test]
fn application_errors_abort_and_surface() {
    let test = scenarios::accounts_ledger(1, 10);
    let err = test
        .execute(|tx| {
            let account = read_account(tx, scenarios::ACCOUNTS, "acct-0")?
                .ok_or_else(|| DriverError::application("missing account"))?;
            if account.balance < 50 {
                return Err(DriverError::application("insufficient funds"));
            }
            Ok(())
        })
        .unwrap_err();

    match err.root_cause() {
        DriverError::Application(source) => assert_eq!(source.to_string(), "insufficient funds"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(test.driver.stats().transactions_failed, 1);
}

#[test]
fn backoff_sequence_matches_custom_function() {
    let test = TestLedger::new();
    test.ledger
        .inject_times(FaultPoint::Commit, Fault::ServiceUnavailable, 3);

    let schedule = [3u64, 1, 2];
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&calls);
    let policy = RetryPolicy::new(3).with_custom_backoff(move |attempt, error, id| {
        recorder.lock().push((attempt, error.class(), id.cloned()));
        Duration::from_millis(schedule[attempt as usize])
    });

    let ids = Mutex::new(Vec::new());
    let started = Instant::now();
    test.execute_with_retry_policy(&policy, |tx| {
        ids.lock().push(tx.transaction_id().clone());
        Ok(())
    })
    .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(6));
    let ids = ids.into_inner();
    let calls = calls.lock();
    assert_eq!(ids.len(), 4);
    assert_eq!(calls.len(), 3);
    for (i, (attempt, class, id)) in calls.iter().enumerate() {
        assert_eq!(*attempt, i as u32);
        assert_eq!(*class, ErrorClass::Transient);
        assert_eq!(id.as_ref(), Some(&ids[i]));
    }
}

#[test]
fn capacity_one_serializes_transactions() {
    let ledger_config = LedgerConfig::new().with_statement_latency(Duration::from_millis(60));
    let driver_config = fast_retry_config().with_max_concurrent_transactions(1);
    let test = TestLedger::with_configs(ledger_config, driver_config);
    test.ledger.create_table("t");

    let started = Instant::now();
    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                test.execute(|tx| {
                    tx.execute_statement("SELECT * FROM t", &[])?;
                    Ok(())
                })
                .unwrap();
            });
        }
    });

    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(test.pool_stats().sessions_created, 1);
    assert_eq!(test.ledger.stats().transactions_committed, 2);
}

#[test]
fn pool_timeout_surfaces_unwrapped() {
    let ledger_config = LedgerConfig::new().with_statement_latency(Duration::from_millis(200));
    let driver_config = fast_retry_config()
        .with_max_concurrent_transactions(1)
        .with_pool_acquire_timeout(Duration::from_millis(20));
    let test = TestLedger::with_configs(ledger_config, driver_config);
    test.ledger.create_table("t");

    thread::scope(|s| {
        s.spawn(|| {
            test.execute(|tx| {
                tx.execute_statement("SELECT * FROM t", &[])?;
                Ok(())
            })
            .unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        let err = test.execute(|_tx| Ok(())).unwrap_err();
        assert!(matches!(err, DriverError::PoolTimeout { .. }));
    });
    assert_eq!(test.pool_stats().acquire_timeouts, 1);
}

#[test]
fn expired_sessions_are_replaced() {
    let test = TestLedger::new();
    test.execute_statement("CREATE TABLE t", &[]).unwrap();
    assert_eq!(test.ledger.active_sessions(), 1);

    test.ledger.expire_all_sessions();
    let mut attempts = 0;
    test.execute(|tx| {
        attempts += 1;
        tx.execute_statement("SELECT * FROM t", &[])?;
        Ok(())
    })
    .unwrap();

    // The stale idle session fails at begin, so the body runs once.
    assert_eq!(attempts, 1);
    assert_eq!(test.pool_stats().sessions_created, 2);
    assert_eq!(test.pool_stats().sessions_discarded, 1);
}

#[test]
fn invalid_session_mid_transaction_is_retried_on_new_session() {
    let test = TestLedger::new();
    test.ledger.create_table("t");
    test.ledger
        .inject(FaultPoint::ExecuteStatement, Fault::InvalidSession);

    let mut attempts = 0;
    test.execute(|tx| {
        attempts += 1;
        tx.execute_statement("SELECT * FROM t", &[])?;
        Ok(())
    })
    .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(test.pool_stats().sessions_created, 2);
    assert_eq!(test.ledger.stats().transactions_aborted, 0);
}

#[test]
fn list_tables_and_single_statements() {
    let test = TestLedger::new();
    assert!(test.list_tables().unwrap().is_empty());

    test.execute_statement("CREATE TABLE owners", &[]).unwrap();
    test.execute_statement("CREATE TABLE cars", &[]).unwrap();
    assert_eq!(test.list_tables().unwrap(), vec!["cars", "owners"]);

    let codec = test.codec();
    let params = [
        codec.encode("vin-1").unwrap(),
        codec.encode(&Account::new("Ada", 3)).unwrap(),
    ];
    let inserted = test.execute_statement("INSERT INTO cars ?, ?", &params).unwrap();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted.consumed_ios().map(|io| io.write_ios), Some(1));

    let rows = test
        .execute_statement("SELECT * FROM cars", &[])
        .unwrap();
    let accounts: Vec<Account> = rows.decode_all(codec).unwrap();
    assert_eq!(accounts, vec![Account::new("Ada", 3)]);
}

#[test]
fn commit_digests_agree_with_service() {
    let test = TestLedger::new();
    test.execute(|tx| {
        tx.execute_statement("CREATE TABLE t", &[])?;
        for i in 0..5 {
            let key = format!("k{i}");
            tx.execute_statement_with("INSERT INTO t ?, ?", &[key.as_str(), "v"])?;
        }
        tx.execute_statement("SELECT * FROM t", &[])?.buffer()?;
        Ok(())
    })
    .unwrap();

    let stats = test.ledger.stats();
    assert_eq!(stats.transactions_committed, 1);
    assert_eq!(stats.digest_mismatches, 0);
    assert_eq!(test.ledger.document_count("t"), 5);
}

#[test]
fn stream_cursor_pages_through_results() {
    let ledger_config = LedgerConfig::new().with_page_size(3);
    let test = TestLedger::with_configs(ledger_config, fast_retry_config());
    for i in 0..10 {
        test.ledger.put_document("docs", &format!("doc-{i:02}"), &i).unwrap();
    }

    let (values, reads) = test
        .execute(|tx| {
            let mut cursor = tx.execute_statement("SELECT * FROM docs", &[])?;
            let mut values = Vec::new();
            for row in cursor.by_ref() {
                values.push(tx.decode::<i32>(&row?)?);
            }
            let reads = cursor.consumed_ios().map_or(0, |io| io.read_ios);
            Ok((values, reads))
        })
        .unwrap();

    assert_eq!(values, (0..10).collect::<Vec<_>>());
    assert_eq!(reads, 10);
    assert_eq!(test.ledger.call_count(FaultPoint::FetchPage), 3);
}

#[test]
fn read_ahead_cursor_pages_in_order_and_commits() {
    let ledger_config = LedgerConfig::new().with_page_size(3);
    let test = TestLedger::with_configs(ledger_config, fast_retry_config().with_read_ahead(2));
    for i in 0..10 {
        test.ledger.put_document("docs", &format!("doc-{i:02}"), &i).unwrap();
    }

    let values = test
        .execute(|tx| {
            let cursor = tx.execute_statement("SELECT * FROM docs", &[])?;
            assert!(cursor.is_read_ahead());
            let mut values = Vec::new();
            for row in cursor {
                values.push(tx.decode::<i32>(&row?)?);
            }
            Ok(values)
        })
        .unwrap();

    assert_eq!(values, (0..10).collect::<Vec<_>>());
    assert_eq!(test.ledger.call_count(FaultPoint::FetchPage), 3);
    assert_eq!(test.ledger.stats().transactions_committed, 1);
}

#[test]
fn partially_read_ahead_cursor_is_stopped_before_commit() {
    let ledger_config = LedgerConfig::new().with_page_size(1);
    let test = TestLedger::with_configs(ledger_config, fast_retry_config().with_read_ahead(3));
    for i in 0..50 {
        test.ledger.put_document("docs", &format!("doc-{i:02}"), &i).unwrap();
    }

    let first = test
        .execute(|tx| {
            let mut cursor = tx.execute_statement("SELECT * FROM docs", &[])?;
            let first = cursor.next().transpose()?;
            match first {
                Some(row) => tx.decode::<i32>(&row),
                None => tx.abort(),
            }
        })
        .unwrap();

    assert_eq!(first, 0);
    assert_eq!(test.ledger.stats().transactions_committed, 1);
    assert!(test.ledger.call_count(FaultPoint::FetchPage) < 49);
}

#[test]
fn read_ahead_fetch_errors_are_retried() {
    let ledger_config = LedgerConfig::new().with_page_size(2);
    let test = TestLedger::with_configs(ledger_config, fast_retry_config().with_read_ahead(2));
    for i in 0..6 {
        test.ledger.put_document("docs", &format!("doc-{i}"), &i).unwrap();
    }
    test.ledger
        .inject(FaultPoint::FetchPage, Fault::ConnectionReset);

    let mut attempts = 0;
    let rows = test
        .execute(|tx| {
            attempts += 1;
            Ok(tx.execute_statement("SELECT * FROM docs", &[])?.buffer()?.len())
        })
        .unwrap();

    assert_eq!(rows, 6);
    assert_eq!(attempts, 2);
}

#[test]
fn invalid_read_ahead_is_rejected() {
    let ledger = Arc::new(InMemoryLedger::new(TEST_LEDGER));
    let result = LedgerDriver::new(
        fast_retry_config().with_read_ahead(1),
        ledger as Arc<dyn Communicator>,
    );
    assert!(matches!(result, Err(DriverError::InvalidConfig { .. })));
}

#[test]
fn body_abort_rolls_back() {
    let test = TestLedger::new();
    let err = test
        .execute(|tx| -> ledger_driver::DriverResult<()> {
            tx.execute_statement("CREATE TABLE t", &[])?;
            tx.abort()
        })
        .unwrap_err();

    assert!(matches!(err.root_cause(), DriverError::Aborted));
    assert!(test.ledger.table_names().is_empty());
    assert_eq!(test.ledger.stats().transactions_aborted, 1);
}

#[test]
fn close_ends_sessions_and_rejects_work() {
    let ledger = Arc::new(InMemoryLedger::new(TEST_LEDGER));
    let driver = LedgerDriver::new(
        fast_retry_config(),
        Arc::clone(&ledger) as Arc<dyn Communicator>,
    )
    .unwrap();

    driver.execute_statement("CREATE TABLE t", &[]).unwrap();
    assert_eq!(ledger.active_sessions(), 1);

    driver.close();
    driver.close();
    assert_eq!(ledger.active_sessions(), 0);
    assert!(matches!(
        driver.execute(|_tx| Ok(())),
        Err(DriverError::DriverClosed)
    ));
    assert!(matches!(driver.list_tables(), Err(DriverError::DriverClosed)));
}

#[test]
fn session_creation_failures_exhaust_the_pool() {
    let ledger = Arc::new(InMemoryLedger::new(TEST_LEDGER));
    ledger.inject_times(FaultPoint::StartSession, Fault::ConnectionReset, 3);
    let driver = LedgerDriver::new(
        fast_retry_config().with_session_creation_attempts(3),
        Arc::clone(&ledger) as Arc<dyn Communicator>,
    )
    .unwrap();

    let err = driver.execute(|_tx| Ok(())).unwrap_err();
    assert!(matches!(err, DriverError::PoolExhausted { attempts: 3, .. }));
    assert!(driver.execute(|_tx| Ok(())).is_ok());
}

#[test]
fn wrong_ledger_name_is_fatal() {
    let ledger = Arc::new(InMemoryLedger::new("some-other-ledger"));
    let driver = LedgerDriver::new(
        DriverConfig::new(TEST_LEDGER),
        ledger as Arc<dyn Communicator>,
    )
    .unwrap();
    assert!(matches!(
        driver.execute(|_tx| Ok(())),
        Err(DriverError::BadRequest { .. })
    ));
}

#[test]
fn concurrent_increments_lose_no_updates() {
    let test = TestLedger::with_configs(
        LedgerConfig::default(),
        fast_retry_config().with_retry_policy(instant_retry_policy(500)),
    );
    let config = StressConfig {
        operations: 120,
        threads: 4,
        keys: 3,
    };
    seed_accounts(&test, &config);

    let result = stress_concurrent_increments(&test.driver, &config);
    assert_eq!(result.failed_ops, 0);
    assert_eq!(total_balance(&test, &config), 120);
    assert!(test.pool_stats().sessions_created <= 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn success_on_attempt_i_stops_retrying(
        retry_limit in retry_limit_strategy(),
        fail_ratio in 0.0f64..=1.0,
        point in attempt_fault_point_strategy(),
        fault in retryable_fault_strategy(),
    ) {
        let failures = (f64::from(retry_limit) * fail_ratio).floor() as usize;
        let test = TestLedger::new();
        test.ledger.create_table("t");
        test.ledger.inject_times(point, fault, failures);

        let result = test.execute_with_retry_policy(&instant_retry_policy(retry_limit), |tx| {
            tx.execute_statement("SELECT * FROM t", &[])?;
            Ok(())
        });

        prop_assert!(result.is_ok());
        prop_assert_eq!(test.driver.stats().retries, failures as u64);
        prop_assert_eq!(test.ledger.stats().transactions_committed, 1);
    }

    #[test]
    fn fatal_faults_stop_after_one_attempt(
        point in attempt_fault_point_strategy(),
        fault in fatal_fault_strategy(),
    ) {
        let test = TestLedger::new();
        test.ledger.create_table("t");
        test.ledger.inject(point, fault);

        let err = test
            .execute(|tx| {
                tx.execute_statement("SELECT * FROM t", &[])?;
                Ok(())
            })
            .unwrap_err();
        prop_assert_eq!(err.attempts(), Some(1));
        prop_assert!(matches!(err, DriverError::TransactionFailed { .. }), "expected TransactionFailed");
    }
}
