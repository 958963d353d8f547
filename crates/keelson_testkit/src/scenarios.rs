//! Reusable end-to-end scenarios.
//!
//! Each helper drives an engine through a complete interaction and
//! asserts on what a consumer would observe.

use crate::fixtures::TestEngine;
use keelson_core::{
    ConstraintContext, ConstraintKind, Engine, Mutation, OutcomeCode, ScriptedSubstrate,
    Transaction, TransactionId, WriteOutcome,
};

/// Partition key used by the scenarios.
pub const PARTITION: &[u8] = b"orders";

/// Returns the key of row `i`.
pub fn row_key(i: usize) -> Vec<u8> {
    format!("row-{i}").into_bytes()
}

/// Builds `n` insert rows with source text `"<i>,item-<i>"`.
pub fn numbered_rows(n: usize) -> Vec<Mutation> {
    (0..n)
        .map(|i| {
            Mutation::insert(row_key(i), format!("{i}|item-{i}").into_bytes())
                .with_source_text(format!("{i},item-{i}"))
        })
        .collect()
}

/// The UNIQUE violation used by the load scenarios.
pub fn unique_violation() -> WriteOutcome {
    WriteOutcome::constraint(
        ConstraintKind::Unique,
        ConstraintContext::new("orders_sku_key", "orders", ["sku"]),
    )
    .with_message("duplicate key value violates unique constraint")
}

/// Scripts the ten-row load: rows 3 and 7 are busy once, row 5 violates
/// a unique constraint.
pub fn script_ten_row_load(substrate: &ScriptedSubstrate) -> Vec<Mutation> {
    substrate.script(row_key(3), [WriteOutcome::from_code(OutcomeCode::RegionTooBusy)]);
    substrate.script(row_key(7), [WriteOutcome::from_code(OutcomeCode::RegionTooBusy)]);
    substrate.script(row_key(5), [unique_violation()]);
    numbered_rows(10)
}

/// Commits two writers in sequence and checks which readers see them.
pub fn check_snapshot_ordering(engine: &Engine) {
    let mut a = engine.begin_transaction().expect("begin a");
    let mut b = engine.begin_transaction().expect("begin b");
    let before_both = engine.begin_read_only().expect("begin reader");

    let commit_a = engine.commit(&mut a).expect("commit a");
    let between = engine.begin_read_only().expect("begin reader");
    let commit_b = engine.commit(&mut b).expect("commit b");
    let after_both = engine.begin_read_only().expect("begin reader");

    assert!(commit_a < between.snapshot());
    assert!(between.snapshot() < commit_b);

    let sees = |reader: &Transaction, candidate: TransactionId| {
        engine.is_visible(reader, candidate).expect("is_visible")
    };
    assert!(!sees(&before_both, a.id()));
    assert!(!sees(&before_both, b.id()));
    assert!(sees(&between, a.id()));
    assert!(!sees(&between, b.id()));
    assert!(sees(&after_both, a.id()));
    assert!(sees(&after_both, b.id()));
}

/// Leaves a writer without renewals past its timeout and checks that a
/// later reader treats it as rolled back.
pub fn check_abandoned_writer_invisible(t: &TestEngine) {
    let writer = t.begin_transaction().expect("begin writer");
    t.manager()
        .keep_alive()
        .expect("engine runs keep-alive")
        .unregister(writer.id());
    t.expire_all();

    let reader = t.begin_read_only().expect("begin reader");
    assert!(!t.is_visible(&reader, writer.id()).expect("is_visible"));
    assert!(t.manager().status(writer.id()).expect("status").final_status().is_some());
}
