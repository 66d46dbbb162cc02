//! Tree and Accumulator. `Tree` carries a name, a root page pointer, a
//! stable integer handle, and a lifecycle. `Accumulator` is a per-tree
//! numeric aggregate backed by a delta log: an update records a delta
//! tagged with the writing transaction's commit timestamp, and a read
//! folds all deltas committed at or before the reader's snapshot.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeLifecycle {
    Created,
    Active,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    Sum,
    Min,
    Max,
    Seq,
}

#[derive(Debug, Clone, Copy)]
struct Delta {
    committed_ts: i64,
    value: i64,
}

/// A per-tree, per-index numeric aggregate with snapshot-consistent
/// visibility.
pub struct Accumulator {
    kind: AccumulatorKind,
    deltas: Mutex<Vec<Delta>>,
}

impl Accumulator {
    pub fn new(kind: AccumulatorKind) -> Self {
        Accumulator {
            kind,
            deltas: Mutex::new(Vec::new()),
        }
    }

    /// Records a delta at the transaction's commit timestamp. For
    /// `Seq`, `value` is the proposed next sequence number rather than
    /// a true delta; folding takes the max.
    pub fn update(&self, committed_ts: i64, value: i64) {
        self.deltas.lock().push(Delta { committed_ts, value });
    }

    /// Folds every delta committed at or before `snapshot_ts`.
    pub fn read(&self, snapshot_ts: i64) -> i64 {
        let deltas = self.deltas.lock();
        let visible = deltas.iter().filter(|d| d.committed_ts <= snapshot_ts);
        match self.kind {
            AccumulatorKind::Sum => visible.map(|d| d.value).sum(),
            AccumulatorKind::Min => visible.map(|d| d.value).min().unwrap_or(i64::MAX),
            AccumulatorKind::Max => visible.map(|d| d.value).max().unwrap_or(i64::MIN),
            AccumulatorKind::Seq => visible.map(|d| d.value).max().unwrap_or(0),
        }
    }
}

/// A named ordered map with a root page pointer, a stable integer
/// handle, and per-tree accumulators.
pub struct Tree {
    pub name: String,
    pub handle: u32,
    root: AtomicU32,
    lifecycle: Mutex<TreeLifecycle>,
    accumulators: Mutex<Vec<Accumulator>>,
}

impl Tree {
    pub fn new(name: impl Into<String>, handle: u32, root: u32) -> Self {
        Tree {
            name: name.into(),
            handle,
            root: AtomicU32::new(root),
            lifecycle: Mutex::new(TreeLifecycle::Created),
            accumulators: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> u32 {
        self.root.load(Ordering::SeqCst)
    }

    pub fn set_root(&self, page_number: u32) {
        self.root.store(page_number, Ordering::SeqCst);
    }

    pub fn activate(&self) {
        *self.lifecycle.lock() = TreeLifecycle::Active;
    }

    /// Marks the tree removed; the caller is responsible for actually
    /// returning its pages to the volume's garbage chain.
    pub fn remove(&self) {
        *self.lifecycle.lock() = TreeLifecycle::Removed;
    }

    pub fn lifecycle(&self) -> TreeLifecycle {
        *self.lifecycle.lock()
    }

    pub fn add_accumulator(&self, kind: AccumulatorKind) -> usize {
        let mut accumulators = self.accumulators.lock();
        accumulators.push(Accumulator::new(kind));
        accumulators.len() - 1
    }

    pub fn accumulator_update(&self, index: usize, committed_ts: i64, value: i64) {
        if let Some(acc) = self.accumulators.lock().get(index) {
            acc.update(committed_ts, value);
        }
    }

    pub fn accumulator_read(&self, index: usize, snapshot_ts: i64) -> Option<i64> {
        self.accumulators.lock().get(index).map(|a| a.read(snapshot_ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_correctness_across_interleaved_commits() {
        let acc = Accumulator::new(AccumulatorKind::Sum);
        acc.update(10, 1);
        acc.update(20, 1);
        acc.update(30, 1);
        assert_eq!(acc.read(100), 3);
        // snapshot at 15 only sees the delta committed at ts=10
        assert_eq!(acc.read(15), 1);
        assert_eq!(acc.read(9), 0);
    }

    #[test]
    fn min_max_seq_fold_independently() {
        let min = Accumulator::new(AccumulatorKind::Min);
        min.update(1, 5);
        min.update(2, -3);
        assert_eq!(min.read(10), -3);

        let seq = Accumulator::new(AccumulatorKind::Seq);
        seq.update(1, 1);
        seq.update(2, 2);
        seq.update(3, 3);
        assert_eq!(seq.read(10), 3);
    }

    #[test]
    fn tree_lifecycle_transitions() {
        let tree = Tree::new("t1", 1, 0);
        assert_eq!(tree.lifecycle(), TreeLifecycle::Created);
        tree.activate();
        assert_eq!(tree.lifecycle(), TreeLifecycle::Active);
        tree.set_root(9);
        assert_eq!(tree.root(), 9);
        tree.remove();
        assert_eq!(tree.lifecycle(), TreeLifecycle::Removed);
    }
}
