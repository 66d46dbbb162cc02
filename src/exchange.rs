//! A per-session cursor over one tree: descent and crab-walk insert,
//! split propagation (claim the child before releasing the parent,
//! walk back up installing separator keys when a page splits), and
//! MVCC-aware fetch/store against the version encoding in
//! [`crate::page::mvv`] and the visibility rule in [`crate::txn`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer_pool::{BufferPool, PageAddress};
use crate::error::{PersistitError, PtResult};
use crate::journal::record::Record;
use crate::journal::JournalManager;
use crate::key::Key;
use crate::page::mvv;
use crate::page::split_join::SplitPolicy;
use crate::page::{Buffer, PageType, TailContent};
use crate::tree::Tree;
use crate::txn::{TransactionIndex, PRIMORDIAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Attempts before a retry loop gives up and surfaces whatever error
/// the last attempt produced.
const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_WW_TIMEOUT: Duration = Duration::from_millis(500);

static NEXT_TREE_HANDLE: AtomicU32 = AtomicU32::new(1);

pub fn allocate_tree_handle() -> u32 {
    NEXT_TREE_HANDLE.fetch_add(1, Ordering::SeqCst)
}

/// A per-session cursor: owns one volume/tree pair and drives
/// store/fetch/remove/traversal against C2-C4 through the buffer pool.
pub struct Exchange {
    pool: Arc<BufferPool>,
    txn_index: Arc<TransactionIndex>,
    journal: Option<Arc<JournalManager>>,
    tree: Arc<Tree>,
    volume_id: u64,
    journal_tree_handle: u32,
    max_attempts: u32,
    ww_timeout: Duration,
}

impl Exchange {
    pub fn new(
        pool: Arc<BufferPool>,
        txn_index: Arc<TransactionIndex>,
        journal: Option<Arc<JournalManager>>,
        tree: Arc<Tree>,
        volume_id: u64,
        journal_tree_handle: u32,
    ) -> Self {
        Exchange {
            pool,
            txn_index,
            journal,
            tree,
            volume_id,
            journal_tree_handle,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            ww_timeout: DEFAULT_WW_TIMEOUT,
        }
    }

    fn addr(&self, page_number: u32) -> PageAddress {
        PageAddress {
            volume_id: self.volume_id,
            page_number,
        }
    }

    /// Descends from the tree root to the leaf that should hold `key`,
    /// crab-walking: the child is claimed before the parent is
    /// released. Returns the path of index-page addresses walked (for
    /// split propagation) and the leaf's address.
    fn descend(&self, key: &Key) -> PtResult<(Vec<PageAddress>, PageAddress)> {
        let mut path = Vec::new();
        let mut current = self.addr(self.tree.root());

        loop {
            let claim = self.pool.get(current, false, false)?;
            let is_index = { claim.page.read().page_type == PageType::Index };
            if !is_index {
                return Ok((path, current));
            }
            let next = {
                let page = claim.page.read();
                child_for_key(&page, key)?
            };
            path.push(current);
            current = self.addr(next);
        }
    }

    /// `store()`: merges a new MVV version into the target leaf,
    /// splitting (and propagating separators up `path`) if it doesn't
    /// fit.
    pub fn store(&self, key: &Key, value: &[u8], start_ts: i64) -> PtResult<()> {
        let mut last_err = None;
        for _ in 0..self.max_attempts {
            match self.try_store(key, value, start_ts) {
                Ok(()) => return Ok(()),
                Err(e @ PersistitError::Rollback(_)) => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| PersistitError::fatal("store: exhausted retry attempts")))
    }

    fn try_store(&self, key: &Key, value: &[u8], start_ts: i64) -> PtResult<()> {
        let (path, leaf_addr) = self.descend(key)?;
        let claim = self.pool.get(leaf_addr, true, false)?;

        {
            let page = claim.page.read();
            let found = page.find_key(key);
            if found.exact {
                if let TailContent::Value(existing) = &page.entries()[found.index].tail {
                    self.check_ww(existing, start_ts)?;
                }
            }
        }

        let new_tail = {
            let page = claim.page.read();
            let found = page.find_key(key);
            let mut buf = if found.exact {
                match &page.entries()[found.index].tail {
                    TailContent::Value(v) => v.clone(),
                    _ => Vec::new(),
                }
            } else {
                Vec::new()
            };
            mvv::store_version(&mut buf, version_handle(start_ts), value, page.page_size)?;
            TailContent::Value(buf)
        };

        let insert_result = {
            let mut page = claim.page.write();
            page.put_value(key.clone(), new_tail.clone())
        };

        match insert_result {
            Ok(_) => {
                claim.page.write().timestamp = start_ts;
                self.pool.set_dirty_at_timestamp(leaf_addr, start_ts)?;
                drop(claim);
                self.txn_index.set_mvv_count(start_ts, 1);
                self.append_journal_store(start_ts, key, value)?;
                Ok(())
            }
            Err(PersistitError::InsufficientCapacity { .. }) => {
                drop(claim);
                self.split_and_retry(&path, leaf_addr, key.clone(), new_tail)?;
                self.pool.set_dirty_at_timestamp(leaf_addr, start_ts).ok();
                self.txn_index.set_mvv_count(start_ts, 1);
                self.append_journal_store(start_ts, key, value)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn check_ww(&self, existing_mvv: &[u8], start_ts: i64) -> PtResult<()> {
        let mut versions = Vec::new();
        mvv::visit_all_versions(existing_mvv, |vh, _, _| versions.push(vh))?;
        let newest = match versions.iter().copied().filter(|vh| *vh != PRIMORDIAL).max() {
            Some(vh) => vh,
            None => return Ok(()),
        };
        let owner_ts = newest as i64;
        if owner_ts == start_ts {
            return Ok(()); // our own earlier write in the same transaction
        }
        match self.txn_index.ww_dependency(newest, self.ww_timeout) {
            crate::txn::WwOutcome::Primordial => Ok(()),
            crate::txn::WwOutcome::Aborted => Ok(()),
            crate::txn::WwOutcome::CommittedAt(commit_ts) if commit_ts > start_ts => {
                Err(PersistitError::Rollback(format!(
                    "write-write conflict: transaction {} committed at {} after our snapshot {}",
                    owner_ts, commit_ts, start_ts
                )))
            }
            // the conflicting writer committed before we even started: not
            // concurrent, just the ordinary "write on top of the latest
            // committed value" case.
            crate::txn::WwOutcome::CommittedAt(_) => Ok(()),
            crate::txn::WwOutcome::TimedOut => Err(PersistitError::Timeout(format!(
                "wwDependency timed out waiting on transaction {}",
                owner_ts
            ))),
        }
    }

    fn split_and_retry(
        &self,
        path: &[PageAddress],
        leaf_addr: PageAddress,
        key: Key,
        tail: TailContent,
    ) -> PtResult<()> {
        let leaf_claim = self.pool.get(leaf_addr, true, false)?;
        let (right_addr, right_claim) = self.pool.allocate(PageType::Data)?;

        let separator = {
            let mut left = leaf_claim.page.write();
            let mut right = right_claim.page.write();
            let sep = left.split(&mut right, key, tail, SplitPolicy::EvenBias)?;
            right.right_sibling = left.right_sibling;
            left.right_sibling = right_addr.page_number;
            sep
        };
        drop(leaf_claim);
        drop(right_claim);

        self.install_separator(path, separator, right_addr.page_number)
    }

    /// Propagates a new separator key / right-child pointer up the
    /// index path, splitting index pages in turn if necessary, or
    /// creating a brand-new root when `path` is empty (the old root
    /// just split).
    fn install_separator(&self, path: &[PageAddress], separator: Key, right_child: u32) -> PtResult<()> {
        if let Some((&parent_addr, rest)) = path.split_last() {
            let parent_claim = self.pool.get(parent_addr, true, false)?;
            let insert_result = {
                let mut parent = parent_claim.page.write();
                parent.put_value(separator.clone(), TailContent::Child(right_child))
            };
            match insert_result {
                Ok(_) => Ok(()),
                Err(PersistitError::InsufficientCapacity { .. }) => {
                    drop(parent_claim);
                    self.split_index_and_retry(rest, parent_addr, separator, right_child)
                }
                Err(e) => Err(e),
            }
        } else {
            // the root itself split: build a fresh index root with two children.
            let old_root = self.tree.root();
            let (new_root_addr, new_root_claim) = self.pool.allocate(PageType::Index)?;
            {
                let mut root = new_root_claim.page.write();
                root.put_value(Key::empty(), TailContent::Child(old_root))?;
                root.put_value(separator, TailContent::Child(right_child))?;
            }
            self.tree.set_root(new_root_addr.page_number);
            Ok(())
        }
    }

    fn split_index_and_retry(
        &self,
        path: &[PageAddress],
        index_addr: PageAddress,
        key: Key,
        right_child: u32,
    ) -> PtResult<()> {
        let left_claim = self.pool.get(index_addr, true, false)?;
        let (right_addr, right_claim) = self.pool.allocate(PageType::Index)?;
        let separator = {
            let mut left = left_claim.page.write();
            let mut right = right_claim.page.write();
            left.split(&mut right, key, TailContent::Child(right_child), SplitPolicy::EvenBias)?
        };
        drop(left_claim);
        drop(right_claim);
        self.install_separator(path, separator, right_addr.page_number)
    }

    /// `fetch()`: finds `key` and decodes the version visible to
    /// `(reader_start_ts, snapshot_ts)`.
    pub fn fetch(&self, key: &Key, reader_start_ts: i64, snapshot_ts: i64) -> PtResult<Option<Vec<u8>>> {
        let (_, leaf_addr) = self.descend(key)?;
        let claim = self.pool.get(leaf_addr, false, false)?;
        let page = claim.page.read();
        let found = page.find_key(key);
        if !found.exact {
            return Ok(None);
        }
        match &page.entries()[found.index].tail {
            TailContent::Value(raw) => self.visible_payload(raw, reader_start_ts, snapshot_ts),
            _ => Ok(None),
        }
    }

    fn visible_payload(&self, raw: &[u8], reader_start_ts: i64, snapshot_ts: i64) -> PtResult<Option<Vec<u8>>> {
        if !mvv::is_mvv(raw) {
            return Ok(if mvv::is_anti_value(raw) { None } else { Some(raw.to_vec()) });
        }
        let mut candidates = Vec::new();
        mvv::visit_all_versions(raw, |vh, _, _| candidates.push(vh))?;
        let visible = candidates
            .into_iter()
            .filter(|&vh| self.txn_index.is_visible(vh, reader_start_ts, snapshot_ts))
            .max();
        match visible {
            None => Ok(None),
            Some(vh) => {
                let payload = mvv::fetch_version(raw, vh)?;
                if mvv::is_anti_value(&payload) {
                    Ok(None)
                } else {
                    Ok(Some(payload))
                }
            }
        }
    }

    pub fn is_value_defined(&self, key: &Key, reader_start_ts: i64, snapshot_ts: i64) -> PtResult<bool> {
        Ok(self.fetch(key, reader_start_ts, snapshot_ts)?.is_some())
    }

    /// `remove(direction)`: writes an anti-value version rather than
    /// physically deleting the key block; `prune_mvv_values` reclaims
    /// it later.
    pub fn remove(&self, key: &Key, start_ts: i64, _direction: Direction) -> PtResult<()> {
        self.store(key, mvv::ANTI_VALUE, start_ts)
    }

    /// `removeAll()`: tombstones every key currently visible to this
    /// transaction, leaf by leaf.
    pub fn remove_all(&self, start_ts: i64, snapshot_ts: i64) -> PtResult<()> {
        let keys = self.collect_all_keys(start_ts, snapshot_ts)?;
        for key in keys {
            self.remove(&key, start_ts, Direction::Forward)?;
        }
        Ok(())
    }

    fn collect_all_keys(&self, reader_start_ts: i64, snapshot_ts: i64) -> PtResult<Vec<Key>> {
        let mut out = Vec::new();
        let mut addr = Some(self.leftmost_leaf()?);
        while let Some(current) = addr {
            let claim = self.pool.get(current, false, false)?;
            let page = claim.page.read();
            for entry in page.entries() {
                if let TailContent::Value(raw) = &entry.tail {
                    if self.visible_payload(raw, reader_start_ts, snapshot_ts)?.is_some() {
                        out.push(entry.key.clone());
                    }
                }
            }
            addr = if page.right_sibling == 0 {
                None
            } else {
                Some(self.addr(page.right_sibling))
            };
        }
        Ok(out)
    }

    /// Reclaims obsolete MVV versions, run leaf by leaf: any active
    /// transaction started no earlier than `floor` still reads through
    /// it, so anything older is dead weight. A caller typically passes
    /// `TransactionIndex::earliest_active_start()` (or the current
    /// timestamp, if no transaction is active) as `floor`. Returns the
    /// total bytes reclaimed across the tree.
    pub fn prune_mvv_values(&self, floor: i64) -> PtResult<usize> {
        let mut reclaimed = 0;
        let mut removed_vhs = std::collections::HashSet::new();
        let mut kept_vhs = std::collections::HashSet::new();
        let mut addr = Some(self.leftmost_leaf()?);
        while let Some(current) = addr {
            let claim = self.pool.get(current, true, false)?;
            let right_sibling = {
                let mut page = claim.page.write();
                let before_vhs = versions_present(&page);
                let this_page = page.prune_mvv_values(floor as u64)?;
                reclaimed += this_page;
                if this_page > 0 {
                    self.pool.set_dirty_at_timestamp(current, floor)?;
                }
                let after_vhs = versions_present(&page);
                removed_vhs.extend(before_vhs.difference(&after_vhs));
                kept_vhs.extend(after_vhs);
                page.right_sibling
            };
            addr = if right_sibling == 0 { None } else { Some(self.addr(right_sibling)) };
        }

        // a version handle removed from every page it appeared on is
        // gone for good; tell the transaction index so a completed
        // status with no surviving MVV content can be swept by
        // `TransactionIndex::cleanup`.
        for vh in removed_vhs.difference(&kept_vhs) {
            if *vh != PRIMORDIAL {
                self.txn_index.set_mvv_count(*vh as i64, 0);
            }
        }
        Ok(reclaimed)
    }

    fn leftmost_leaf(&self) -> PtResult<PageAddress> {
        let mut current = self.addr(self.tree.root());
        loop {
            let claim = self.pool.get(current, false, false)?;
            let page = claim.page.read();
            if page.page_type != PageType::Index {
                return Ok(current);
            }
            let child = match page.entries().first() {
                Some(e) => match e.tail {
                    TailContent::Child(c) => c,
                    _ => return Err(PersistitError::fatal("index page entry without child pointer")),
                },
                None => return Err(PersistitError::fatal("empty index page")),
            };
            drop(page);
            drop(claim);
            current = self.addr(child);
        }
    }

    /// `traverse(direction, deep)`: returns the next (or previous) key
    /// after `from`, respecting visibility; `deep=false` groups by
    /// [`Key::first_segment`].
    pub fn traverse(
        &self,
        from: &Key,
        direction: Direction,
        deep: bool,
        reader_start_ts: i64,
        snapshot_ts: i64,
    ) -> PtResult<Option<Key>> {
        let all = self.collect_all_keys(reader_start_ts, snapshot_ts)?;
        let mut ordered = all;
        ordered.sort();
        if direction == Direction::Reverse {
            ordered.reverse();
        }

        let is_past = |k: &Key| match direction {
            Direction::Forward => k > from,
            Direction::Reverse => k < from,
        };

        let mut iter = ordered.into_iter().filter(|k| is_past(k));
        if deep {
            return Ok(iter.next());
        }
        let from_segment = from.first_segment().to_vec();
        Ok(iter.find(|k| k.first_segment() != from_segment))
    }

    pub fn next(&self, from: &Key, deep: bool, reader_start_ts: i64, snapshot_ts: i64) -> PtResult<Option<Key>> {
        self.traverse(from, Direction::Forward, deep, reader_start_ts, snapshot_ts)
    }

    pub fn previous(&self, from: &Key, deep: bool, reader_start_ts: i64, snapshot_ts: i64) -> PtResult<Option<Key>> {
        self.traverse(from, Direction::Reverse, deep, reader_start_ts, snapshot_ts)
    }

    fn append_journal_store(&self, start_ts: i64, key: &Key, value: &[u8]) -> PtResult<()> {
        if let Some(journal) = &self.journal {
            journal.write_record(&Record::Store {
                start_ts,
                tree_handle: self.journal_tree_handle,
                key: key.bytes().to_vec(),
                value: value.to_vec(),
            })?;
        }
        Ok(())
    }
}

/// Version handles are the owning transaction's start timestamp;
/// `PRIMORDIAL` (0) is reserved, so real transactions always start
/// above it (the timestamp allocator starts at 0 and `allocate()`
/// always returns a value ≥ 1).
fn version_handle(start_ts: i64) -> u64 {
    debug_assert!(start_ts > 0, "start_ts must be a minted timestamp, not PRIMORDIAL");
    start_ts as u64
}

fn versions_present(page: &Buffer) -> std::collections::HashSet<u64> {
    let mut seen = std::collections::HashSet::new();
    for entry in page.entries() {
        if let TailContent::Value(raw) = &entry.tail {
            if mvv::is_mvv(raw) {
                let _ = mvv::visit_all_versions(raw, |vh, _, _| {
                    seen.insert(vh);
                });
            }
        }
    }
    seen
}

fn child_for_key(page: &Buffer, key: &Key) -> PtResult<u32> {
    let found = page.find_key(key);
    let idx = if found.exact { found.index } else { found.index.saturating_sub(1) };
    match page.entries().get(idx).or_else(|| page.entries().first()) {
        Some(entry) => match entry.tail {
            TailContent::Child(child) => Ok(child),
            _ => Err(PersistitError::fatal("index page entry without child pointer")),
        },
        None => Err(PersistitError::fatal("index page has no entries to descend into")),
    }
}
