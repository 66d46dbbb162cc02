//! An explicit per-thread transaction handle: one value a caller owns
//! and passes around, carrying its own start timestamp, snapshot, and
//! the `Exchange`s it has opened against a `Database`, instead of
//! reaching into thread-local or process-global state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::database::{Database, OpenVolume};
use crate::error::PtResult;
use crate::exchange::Exchange;
use crate::journal::record::Record;
use crate::timestamp::TimestampAllocator;
use crate::txn::CommitOutcome;

/// One logical transaction: a start timestamp, the snapshot it reads
/// through, and the exchanges it has opened so far.
pub struct Session<'db> {
    db: &'db Database,
    clock: Arc<TimestampAllocator>,
    start_ts: i64,
    snapshot_ts: i64,
    exchanges: HashMap<(u64, u32), Exchange>,
    finished: bool,
}

impl<'db> Session<'db> {
    /// Begins a transaction: registers a fresh start timestamp with
    /// the transaction index, durably logs a `TransactionStart` record,
    /// and pins the snapshot to that same value. Call `refresh_snapshot`
    /// to raise it explicitly.
    pub fn begin(db: &'db Database, clock: Arc<TimestampAllocator>) -> PtResult<Self> {
        let start_ts = clock.allocate();
        db.journal.write_record(&Record::TransactionStart { start_ts })?;
        db.txn_index.register(start_ts);
        Ok(Session {
            db,
            clock,
            start_ts,
            snapshot_ts: start_ts,
            exchanges: HashMap::new(),
            finished: false,
        })
    }

    pub fn start_ts(&self) -> i64 {
        self.start_ts
    }

    /// Raises the snapshot to "now" without changing which
    /// transaction owns this session's own writes.
    pub fn refresh_snapshot(&mut self) {
        self.snapshot_ts = self.clock.peek();
    }

    /// Opens (and caches) an `Exchange` over one volume/tree pair.
    pub fn exchange(&mut self, volume: &Arc<OpenVolume>, tree_name: &str) -> PtResult<&Exchange> {
        let tree = volume.tree(tree_name)?;
        let key = (volume.volume_id, tree.handle);
        if !self.exchanges.contains_key(&key) {
            let exchange = Exchange::new(
                Arc::clone(&volume.pool),
                Arc::clone(&self.db.txn_index),
                Some(Arc::clone(&self.db.journal)),
                Arc::clone(&tree),
                volume.volume_id,
                tree.handle,
            );
            self.exchanges.insert(key, exchange);
        }
        Ok(self.exchanges.get(&key).unwrap())
    }

    pub fn store(&mut self, volume: &Arc<OpenVolume>, tree_name: &str, key: &crate::key::Key, value: &[u8]) -> PtResult<()> {
        let start_ts = self.start_ts;
        self.exchange(volume, tree_name)?.store(key, value, start_ts)
    }

    pub fn fetch(&mut self, volume: &Arc<OpenVolume>, tree_name: &str, key: &crate::key::Key) -> PtResult<Option<Vec<u8>>> {
        let start_ts = self.start_ts;
        let snapshot_ts = self.snapshot_ts;
        self.exchange(volume, tree_name)?.fetch(key, start_ts, snapshot_ts)
    }

    pub fn remove(&mut self, volume: &Arc<OpenVolume>, tree_name: &str, key: &crate::key::Key) -> PtResult<()> {
        let start_ts = self.start_ts;
        self.exchange(volume, tree_name)?
            .remove(key, start_ts, crate::exchange::Direction::Forward)
    }

    /// Reclaims obsolete MVV versions from one tree, using the lowest
    /// start timestamp of any still-active transaction as the floor
    /// (or this session's own snapshot if none are active). Returns the
    /// bytes reclaimed.
    pub fn prune(&mut self, volume: &Arc<OpenVolume>, tree_name: &str) -> PtResult<usize> {
        let floor = self.db.txn_index.earliest_active_start().unwrap_or(self.snapshot_ts);
        self.exchange(volume, tree_name)?.prune_mvv_values(floor)
    }

    /// Commits: mints a commit timestamp, durably logs a
    /// `TransactionCommit` record before a committed version can
    /// become visible to anyone else, then notifies the transaction
    /// index and lets every blocked `wwDependency` caller proceed.
    pub fn commit(mut self) -> PtResult<i64> {
        let commit_ts = self.clock.allocate();
        self.db.txn_index.begin_commit(self.start_ts)?;
        self.db.journal.write_record(&Record::TransactionCommit {
            start_ts: self.start_ts,
            commit_ts,
        })?;
        self.db
            .txn_index
            .notify_completed(self.start_ts, CommitOutcome::Committed(commit_ts))?;
        self.finished = true;
        self.db.txn_index.cleanup();
        Ok(commit_ts)
    }

    pub fn rollback(mut self) -> PtResult<()> {
        self.db.txn_index.notify_completed(self.start_ts, CommitOutcome::Aborted)?;
        self.finished = true;
        self.db.txn_index.cleanup();
        Ok(())
    }
}

impl<'db> Drop for Session<'db> {
    /// A session abandoned without an explicit `commit`/`rollback` (an
    /// early return, a panic unwinding through it) must not leave its
    /// start timestamp registered forever; treat it as aborted.
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.db.txn_index.notify_completed(self.start_ts, CommitOutcome::Aborted);
            self.db.txn_index.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::key::Key;
    use tempfile::tempdir;

    #[test]
    fn a_session_sees_its_own_uncommitted_writes_but_not_anothers() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::default(), dir.path().join("journal")).unwrap();
        let volume = db.open_volume(dir.path().join("v.db"), 4096).unwrap();
        let clock = Arc::new(TimestampAllocator::default());

        let mut writer = Session::begin(&db, Arc::clone(&clock)).unwrap();
        writer.store(&volume, "t", &Key::from("k"), b"v1").unwrap();
        assert_eq!(writer.fetch(&volume, "t", &Key::from("k")).unwrap(), Some(b"v1".to_vec()));

        let mut reader = Session::begin(&db, Arc::clone(&clock)).unwrap();
        assert_eq!(reader.fetch(&volume, "t", &Key::from("k")).unwrap(), None);

        let commit_ts = writer.commit().unwrap();
        reader.snapshot_ts = commit_ts;
        assert_eq!(reader.fetch(&volume, "t", &Key::from("k")).unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn rollback_leaves_writes_permanently_invisible() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::default(), dir.path().join("journal")).unwrap();
        let volume = db.open_volume(dir.path().join("v.db"), 4096).unwrap();
        let clock = Arc::new(TimestampAllocator::default());

        let mut writer = Session::begin(&db, Arc::clone(&clock)).unwrap();
        writer.store(&volume, "t", &Key::from("k"), b"v1").unwrap();
        writer.rollback().unwrap();

        let mut reader = Session::begin(&db, Arc::clone(&clock)).unwrap();
        reader.refresh_snapshot();
        assert_eq!(reader.fetch(&volume, "t", &Key::from("k")).unwrap(), None);
    }

    #[test]
    fn dropping_a_session_without_commit_or_rollback_still_aborts_it() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::default(), dir.path().join("journal")).unwrap();
        let volume = db.open_volume(dir.path().join("v.db"), 4096).unwrap();
        let clock = Arc::new(TimestampAllocator::default());

        {
            let mut writer = Session::begin(&db, Arc::clone(&clock)).unwrap();
            writer.store(&volume, "t", &Key::from("k"), b"v1").unwrap();
            // writer falls out of scope here with no commit/rollback
        }

        let mut reader = Session::begin(&db, Arc::clone(&clock)).unwrap();
        reader.refresh_snapshot();
        assert_eq!(reader.fetch(&volume, "t", &Key::from("k")).unwrap(), None);
    }
}
