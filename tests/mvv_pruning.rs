mod common;

use std::sync::Arc;

use persistit_core::key::Key;
use persistit_core::session::Session;

#[test]
fn pruning_reclaims_superseded_versions_once_no_reader_can_see_them() {
    let (_dir, db, volume, clock) = common::fresh_database(4096);

    let mut first = Session::begin(&db, Arc::clone(&clock)).unwrap();
    first.store(&volume, "accounts", &Key::from("alice"), b"100").unwrap();
    first.commit().unwrap();

    let mut second = Session::begin(&db, Arc::clone(&clock)).unwrap();
    second.store(&volume, "accounts", &Key::from("alice"), b"200").unwrap();
    second.commit().unwrap();

    // no transaction is active any longer, so pruning's floor can reach
    // all the way to "now" and collapse the history down to one version.
    let mut pruner = Session::begin(&db, Arc::clone(&clock)).unwrap();
    let reclaimed = pruner.prune(&volume, "accounts").unwrap();
    assert!(reclaimed > 0, "expected the superseded version to be reclaimed");

    pruner.refresh_snapshot();
    assert_eq!(
        pruner.fetch(&volume, "accounts", &Key::from("alice")).unwrap(),
        Some(b"200".to_vec())
    );
    pruner.rollback().unwrap();
}

#[test]
fn pruning_never_reclaims_a_version_an_active_reader_still_needs() {
    let (_dir, db, volume, clock) = common::fresh_database(4096);

    let mut first = Session::begin(&db, Arc::clone(&clock)).unwrap();
    first.store(&volume, "accounts", &Key::from("bob"), b"1").unwrap();
    first.commit().unwrap();

    // this reader's snapshot predates the second write, so pruning must
    // never touch the version it still resolves to.
    let mut long_reader = Session::begin(&db, Arc::clone(&clock)).unwrap();

    let mut second = Session::begin(&db, Arc::clone(&clock)).unwrap();
    second.store(&volume, "accounts", &Key::from("bob"), b"2").unwrap();
    second.commit().unwrap();

    let mut pruner = Session::begin(&db, Arc::clone(&clock)).unwrap();
    pruner.prune(&volume, "accounts").unwrap();

    assert_eq!(
        long_reader.fetch(&volume, "accounts", &Key::from("bob")).unwrap(),
        Some(b"1".to_vec())
    );
    long_reader.rollback().unwrap();
    pruner.rollback().unwrap();
}
