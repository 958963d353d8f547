//! Batch writes through the engine: retries, rejects and bad records.

use keelson_core::{
    ConstraintKind, CoreError, OutcomeCode, PipelineState, TxnStatus, WriteOptions, WriteOutcome,
};
use keelson_testkit::{
    numbered_rows, row_key, script_ten_row_load, unique_violation, TestEngine, PARTITION,
};

#[test]
fn permissive_load_writes_around_a_bad_row() {
    let t = TestEngine::memory();
    let rows = script_ten_row_load(&t.substrate);
    let mut txn = t.begin_transaction().unwrap();

    let result = t
        .submit_write_batch(&mut txn, PARTITION, &rows, true, 5)
        .unwrap();

    assert_eq!(result.written, 9);
    assert_eq!(result.stats.written, 9);
    assert_eq!(result.stats.ignored, 1);
    assert_eq!(result.stats.retried, 2);
    assert_eq!(result.stats.region_too_busy, 2);
    assert_eq!(result.stats.thrown, 0);
    assert_eq!(result.state, PipelineState::PartiallySucceeded);

    let bad = result.bad_records.as_ref().unwrap();
    assert_eq!(bad.count, 1);
    assert!(!bad.exceeded);
    let file = format!("txn-{}.bad", txn.id().as_u64());
    assert_eq!(bad.file, format!("status/{file}"));
    assert_eq!(t.sink_lines(&file).unwrap(), ["UNIQUE 5,item-5"]);

    let failed: Vec<_> = result.failed_rows().map(|(i, _)| i).collect();
    assert_eq!(failed, [5]);
    assert_eq!(t.substrate.attempts_for(&row_key(3)), 2);
    assert_eq!(t.substrate.attempts_for(&row_key(5)), 1);
    assert_eq!(t.substrate.distinct_rows_written(), 9);

    t.commit(&mut txn).unwrap();
}

#[test]
fn strict_load_fails_with_constraint_context() {
    let t = TestEngine::memory();
    let rows = script_ten_row_load(&t.substrate);
    let mut txn = t.begin_transaction().unwrap();

    let err = t
        .submit_write_batch(&mut txn, PARTITION, &rows, false, 0)
        .unwrap_err();

    let CoreError::WriteRejected { row, outcome } = err else {
        panic!("expected a rejected row, got {err}");
    };
    assert_eq!(row, 5);
    assert_eq!(outcome.code(), OutcomeCode::Constraint(ConstraintKind::Unique));
    let context = outcome.constraint_context().unwrap();
    assert_eq!(context.constraint, "orders_sku_key");
    assert_eq!(context.table.as_deref(), Some("orders"));
    assert_eq!(context.columns, ["sku"]);
    assert!(outcome.message().unwrap().contains("duplicate key"));

    // A rejected row is not fatal; the owner decides what to do.
    assert!(txn.is_active());
    t.rollback(&mut txn).unwrap();
    assert!(t.status_dir.names().is_empty());
}

#[test]
fn strict_pipeline_keeps_stats_after_reject() {
    let t = TestEngine::memory();
    let rows = script_ten_row_load(&t.substrate);
    let txn = t.begin_transaction().unwrap();
    let mut pipeline = t.write_pipeline(WriteOptions::strict()).unwrap();

    assert!(pipeline.submit(&txn, PARTITION, &rows).is_err());
    assert_eq!(pipeline.state(), PipelineState::Rejected);
    // Rows 0, 1, 2 and 4 went through before row 5 was seen.
    assert_eq!(pipeline.stats().written, 4);
    assert_eq!(pipeline.stats().region_too_busy, 1);
}

#[test]
fn tolerance_breach_stops_the_load() {
    let t = TestEngine::memory();
    for i in [1, 2, 3] {
        t.substrate.script(row_key(i), [unique_violation()]);
    }
    let txn = t.begin_transaction().unwrap();
    let mut pipeline = t
        .write_pipeline(WriteOptions::permissive("/imports/orders.csv", 1))
        .unwrap();

    let err = pipeline.submit(&txn, PARTITION, &numbered_rows(5)).unwrap_err();
    let CoreError::BadRecordToleranceExceeded { count, tolerance, file } = err else {
        panic!("expected tolerance breach, got {err}");
    };
    assert_eq!((count, tolerance), (2, 1));
    assert_eq!(file, "status/orders.bad");
    assert_eq!(pipeline.state(), PipelineState::Rejected);

    let recorder = pipeline.recorder().unwrap();
    assert!(recorder.is_closed());
    assert_eq!(t.sink_lines("orders.bad").unwrap().len(), 2);
}

#[test]
fn unlimited_tolerance_never_stops() {
    let t = TestEngine::memory();
    for i in 0..6 {
        t.substrate.script(row_key(i), [unique_violation()]);
    }
    let mut txn = t.begin_transaction().unwrap();
    let result = t
        .submit_write_batch(&mut txn, PARTITION, &numbered_rows(6), true, -1)
        .unwrap();
    assert_eq!(result.written, 0);
    assert_eq!(result.stats.ignored, 6);
    assert_eq!(result.state, PipelineState::Rejected);
    assert!(!result.bad_records.unwrap().exceeded);
}

#[test]
fn exhausted_retries_are_thrown() {
    let t = TestEngine::memory();
    let busy = || WriteOutcome::from_code(OutcomeCode::PipelineTooBusy).with_message("queue full");
    t.substrate.script(row_key(2), std::iter::repeat_with(busy).take(5));
    let mut txn = t.begin_transaction().unwrap();

    let result = t
        .submit_write_batch(&mut txn, PARTITION, &numbered_rows(4), true, 0)
        .unwrap();
    assert_eq!(result.written, 3);
    assert_eq!(result.stats.thrown, 1);
    assert_eq!(result.stats.retried, 4);
    assert_eq!(result.stats.region_too_busy, 5);
    assert_eq!(result.state, PipelineState::PartiallySucceeded);
    assert_eq!(result.outcomes[2].message(), Some("queue full"));
    assert_eq!(result.bad_records.unwrap().count, 0);
}

#[test]
fn exhausted_retries_fail_strict_loads() {
    let t = TestEngine::memory();
    t.substrate.script(
        row_key(0),
        std::iter::repeat_with(|| WriteOutcome::from_code(OutcomeCode::RegionTooBusy)).take(5),
    );
    let mut txn = t.begin_transaction().unwrap();

    let err = t
        .submit_write_batch(&mut txn, PARTITION, &numbered_rows(2), false, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::RetriesExhausted { rows: 1, attempts: 5, .. }
    ));
}

#[test]
fn stale_routes_are_refreshed_before_retry() {
    let t = TestEngine::memory();
    t.substrate.script(row_key(1), [WriteOutcome::from_code(OutcomeCode::WrongRegion)]);
    let mut txn = t.begin_transaction().unwrap();

    let result = t
        .submit_write_batch(&mut txn, PARTITION, &numbered_rows(3), false, 0)
        .unwrap();
    assert_eq!(result.state, PipelineState::Succeeded);
    assert_eq!(t.locator.invalidations(), 1);

    let calls = t.substrate.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].address.generation, 0);
    assert_eq!(calls[1].address.generation, 1);
    assert_eq!(calls[1].row_keys, [row_key(1)]);
}

#[test]
fn fatal_outcome_aborts_batch_and_transaction() {
    let t = TestEngine::memory();
    t.substrate.script(row_key(0), [WriteOutcome::from_code(OutcomeCode::RegionTooBusy)]);
    t.substrate.script(row_key(2), [WriteOutcome::from_code(OutcomeCode::Interrupted)]);
    let mut txn = t.begin_transaction().unwrap();

    let err = t
        .submit_write_batch(&mut txn, PARTITION, &numbered_rows(4), true, 10)
        .unwrap_err();
    assert!(matches!(err, CoreError::WriteAborted { row: 2, .. }));
    // Aborted on the first attempt, nothing retried.
    assert_eq!(t.substrate.attempts_for(&row_key(0)), 1);
    assert!(!txn.is_active());
    assert_eq!(t.status(txn.id()).unwrap(), TxnStatus::Error);
    assert_eq!(t.metrics().failed, 1);
}

#[test]
fn retryable_transport_errors_consume_attempts() {
    let t = TestEngine::memory();
    t.substrate.fail_next_call(CoreError::substrate_retryable("connection reset"));
    t.substrate.fail_next_call(CoreError::substrate_retryable("connection reset"));
    let mut txn = t.begin_transaction().unwrap();

    let result = t
        .submit_write_batch(&mut txn, PARTITION, &numbered_rows(3), false, 0)
        .unwrap();
    assert_eq!(result.written, 3);
    assert_eq!(result.stats.retried, 6);
    assert_eq!(t.substrate.calls().len(), 3);
}

#[test]
fn pipeline_accumulates_stats_across_batches() {
    let t = TestEngine::memory();
    t.substrate.script(row_key(1), [unique_violation()]);
    let txn = t.begin_transaction().unwrap();
    let mut pipeline = t
        .write_pipeline(WriteOptions::permissive("items.tsv", -1))
        .unwrap();

    let first = pipeline.submit(&txn, PARTITION, &numbered_rows(3)).unwrap();
    let second = pipeline.submit(&txn, b"other", &numbered_rows(2)).unwrap();
    assert_eq!(first.stats.written + second.stats.written, 4);

    let (stats, recorder) = pipeline.finish().unwrap();
    assert_eq!(stats.written, 4);
    assert_eq!(stats.ignored, 1);
    let recorder = recorder.unwrap();
    assert_eq!(recorder.number_of_bad_records(), 1);
    assert_eq!(recorder.bad_record_file_name(), "status/items.bad");
}

#[test]
fn sink_names_avoid_existing_files() {
    let t = TestEngine::memory();
    t.status_dir.touch("orders.bad").unwrap();
    t.status_dir.touch("orders_1.bad").unwrap();

    let pipeline = t
        .write_pipeline(WriteOptions::permissive("orders.csv", 0))
        .unwrap();
    assert_eq!(
        pipeline.recorder().unwrap().bad_record_file_name(),
        "status/orders_2.bad"
    );
}

#[test]
fn clean_permissive_load_leaves_no_sink_file() {
    let t = TestEngine::memory();
    let mut txn = t.begin_transaction().unwrap();
    for _ in 0..3 {
        let result = t
            .submit_write_batch(&mut txn, PARTITION, &numbered_rows(4), true, 0)
            .unwrap();
        assert_eq!(result.state, PipelineState::Succeeded);
    }
    t.commit(&mut txn).unwrap();
    assert!(t.status_dir.names().is_empty());
}

#[test]
fn tolerance_spans_batches_of_one_transaction() {
    let t = TestEngine::memory();
    t.substrate.script(row_key(1), [unique_violation(), unique_violation()]);
    let mut txn = t.begin_transaction().unwrap();

    let first = t
        .submit_write_batch(&mut txn, PARTITION, &numbered_rows(3), true, 1)
        .unwrap();
    assert_eq!(first.bad_records.unwrap().count, 1);

    let err = t
        .submit_write_batch(&mut txn, PARTITION, &numbered_rows(3), true, 1)
        .unwrap_err();
    let CoreError::BadRecordToleranceExceeded { count, file, .. } = err else {
        panic!("expected tolerance breach, got {err}");
    };
    let name = format!("txn-{}.bad", txn.id().as_u64());
    assert_eq!(count, 2);
    assert_eq!(file, format!("status/{name}"));
    assert_eq!(t.status_dir.names(), [name.clone()]);
    assert_eq!(t.sink_lines(&name).unwrap().len(), 2);
    t.rollback(&mut txn).unwrap();
}
