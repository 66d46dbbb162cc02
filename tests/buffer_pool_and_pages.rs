mod common;

use std::sync::Arc;

use persistit_core::key::Key;
use persistit_core::session::Session;

#[test]
fn many_keys_survive_repeated_page_splits_across_the_smallest_page_size() {
    let (_dir, db, volume, clock) = common::fresh_database(1024);

    let mut writer = Session::begin(&db, Arc::clone(&clock)).unwrap();
    for i in 0..500u32 {
        writer
            .store(&volume, "wide", &Key::from(i.to_be_bytes().to_vec()), &i.to_be_bytes())
            .unwrap();
    }
    writer.commit().unwrap();

    let mut reader = Session::begin(&db, Arc::clone(&clock)).unwrap();
    reader.refresh_snapshot();
    for i in 0..500u32 {
        let got = reader.fetch(&volume, "wide", &Key::from(i.to_be_bytes().to_vec())).unwrap();
        assert_eq!(got, Some(i.to_be_bytes().to_vec()), "key {} lost across splits", i);
    }
}

#[test]
fn buffer_pool_never_exceeds_its_configured_capacity() {
    let (_dir, _db, volume, _clock) = common::fresh_database(4096);
    assert!(volume.pool.resident_count() <= volume.pool.capacity());

    for i in 0..volume.pool.capacity() + 50 {
        let (_addr, claim) = volume.pool.allocate(persistit_core::page::PageType::Data).unwrap();
        drop(claim);
        assert!(
            volume.pool.resident_count() <= volume.pool.capacity(),
            "resident pages exceeded capacity after {} allocations",
            i
        );
    }
}

#[test]
fn a_brand_new_tree_starts_with_no_visible_keys() {
    let (_dir, db, volume, clock) = common::fresh_database(4096);
    let mut reader = Session::begin(&db, Arc::clone(&clock)).unwrap();
    assert_eq!(reader.fetch(&volume, "empty", &Key::from("anything")).unwrap(), None);
}
