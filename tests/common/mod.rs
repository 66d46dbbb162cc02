use std::sync::Arc;

use persistit_core::config::Config;
use persistit_core::database::{Database, OpenVolume};
use persistit_core::timestamp::TimestampAllocator;

/// Opens a fresh `Database` plus one volume inside a throwaway
/// temporary directory, building the on-disk volume/journal pair
/// integration tests need.
pub fn fresh_database(page_size: usize) -> (tempfile::TempDir, Database, Arc<OpenVolume>, Arc<TimestampAllocator>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(Config::default(), dir.path().join("journal")).unwrap();
    let volume = db.open_volume(dir.path().join("data.db"), page_size).unwrap();
    let clock = Arc::new(TimestampAllocator::default());
    (dir, db, volume, clock)
}
