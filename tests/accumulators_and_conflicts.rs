mod common;

use std::sync::Arc;
use std::time::Duration;

use persistit_core::error::PersistitError;
use persistit_core::key::Key;
use persistit_core::session::Session;
use persistit_core::txn::{CommitOutcome, WwOutcome};

#[test]
fn accumulator_sum_reflects_only_deltas_committed_at_or_before_the_snapshot() {
    let (_dir, db, volume, _clock) = common::fresh_database(4096);
    let tree = volume.tree("ledger").unwrap();
    let idx = tree.add_accumulator(persistit_core::tree::AccumulatorKind::Sum);

    tree.accumulator_update(idx, 10, 5);
    tree.accumulator_update(idx, 20, 7);
    tree.accumulator_update(idx, 30, 3);

    assert_eq!(tree.accumulator_read(idx, 15), Some(5));
    assert_eq!(tree.accumulator_read(idx, 25), Some(12));
    assert_eq!(tree.accumulator_read(idx, 100), Some(15));
}

#[test]
fn a_second_writer_blocked_on_the_same_key_times_out_rather_than_deadlocking() {
    let (_dir, db, volume, clock) = common::fresh_database(4096);

    let mut first = Session::begin(&db, Arc::clone(&clock)).unwrap();
    first.store(&volume, "locks", &Key::from("row"), b"v1").unwrap();

    // the first writer's transaction is still open (no commit/rollback
    // yet), so a write-write check against the same key must resolve by
    // timeout, never by hanging.
    let outcome = db.txn_index.ww_dependency(first.start_ts() as u64, Duration::from_millis(50));
    assert_eq!(outcome, WwOutcome::TimedOut);

    first.commit().unwrap();
}

#[test]
fn ww_dependency_resolves_once_the_blocking_writer_commits() {
    let (_dir, db, _volume, clock) = common::fresh_database(4096);
    let start_ts = clock.allocate();
    db.txn_index.register(start_ts);

    db.txn_index
        .notify_completed(start_ts, CommitOutcome::Committed(start_ts + 1))
        .unwrap();

    let outcome = db.txn_index.ww_dependency(start_ts as u64, Duration::from_millis(50));
    assert_eq!(outcome, WwOutcome::CommittedAt(start_ts + 1));
}

#[test]
fn a_writer_whose_key_was_overwritten_by_a_committed_transaction_is_rolled_back() {
    let (_dir, db, volume, clock) = common::fresh_database(4096);

    // second starts while first is still open, so the two are genuinely
    // concurrent: whichever commits first wins, and the other must abort.
    let mut first = Session::begin(&db, Arc::clone(&clock)).unwrap();
    let mut second = Session::begin(&db, Arc::clone(&clock)).unwrap();

    first.store(&volume, "ledger_rows", &Key::from("row"), b"from-first").unwrap();
    first.commit().unwrap();

    let result = second.store(&volume, "ledger_rows", &Key::from("row"), b"from-second");
    assert!(matches!(result, Err(PersistitError::Rollback(_))));

    second.rollback().unwrap();

    let mut reader = Session::begin(&db, Arc::clone(&clock)).unwrap();
    reader.refresh_snapshot();
    assert_eq!(
        reader.fetch(&volume, "ledger_rows", &Key::from("row")).unwrap(),
        Some(b"from-first".to_vec())
    );
}
