//! Transaction index: a central table mapping transactions to the
//! version handles they own, tracking each one's lifecycle (registered,
//! committed at some timestamp, or aborted) and backing a
//! timeout-only `ww_dependency` contract — a writer blocked behind an
//! in-flight transaction waits on a condvar rather than spinning, and
//! gives up once the timeout elapses rather than via cycle detection
//! (which survives only as a diagnostic in [`wait_for_graph`]).

pub mod wait_for_graph;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{PersistitError, PtResult};

pub type VersionHandle = u64;

/// Sentinel version handle meaning "always visible, pre-transactional".
pub const PRIMORDIAL: VersionHandle = 0;

/// Effective commit status returned by `commit_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Primordial,
    Uncommitted,
    Aborted,
    CommittedAt(i64),
}

/// Outcome of a `ww_dependency` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WwOutcome {
    Primordial,
    CommittedAt(i64),
    Aborted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Registered,
    Committing,
    Committed(i64),
    Aborted,
}

struct Status {
    start_ts: i64,
    lifecycle: Lifecycle,
    mvv_count: u32,
    completion: Arc<(Mutex<bool>, Condvar)>,
}

/// Hash table of transaction statuses keyed by start timestamp, with a
/// completion condvar per entry so a blocked waiter can be woken the
/// moment its dependency resolves instead of polling.
pub struct TransactionIndex {
    statuses: Mutex<HashMap<i64, Status>>,
}

impl Default for TransactionIndex {
    fn default() -> Self {
        TransactionIndex {
            statuses: Mutex::new(HashMap::new()),
        }
    }
}

impl TransactionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly started transaction (`Registered(ts)`).
    pub fn register(&self, start_ts: i64) {
        let mut statuses = self.statuses.lock();
        statuses.insert(
            start_ts,
            Status {
                start_ts,
                lifecycle: Lifecycle::Registered,
                mvv_count: 0,
                completion: Arc::new((Mutex::new(false), Condvar::new())),
            },
        );
    }

    pub fn begin_commit(&self, start_ts: i64) -> PtResult<()> {
        let mut statuses = self.statuses.lock();
        let status = statuses
            .get_mut(&start_ts)
            .ok_or_else(|| PersistitError::fatal(format!("begin_commit: unknown transaction {}", start_ts)))?;
        status.lifecycle = Lifecycle::Committing;
        Ok(())
    }

    /// Finalizes the transaction's status, waking any thread blocked
    /// in `ww_dependency`.
    pub fn notify_completed(&self, start_ts: i64, outcome: CommitOutcome) -> PtResult<()> {
        let completion = {
            let mut statuses = self.statuses.lock();
            let status = statuses.get_mut(&start_ts).ok_or_else(|| {
                PersistitError::fatal(format!("notify_completed: unknown transaction {}", start_ts))
            })?;
            status.lifecycle = match outcome {
                CommitOutcome::Committed(tc) => Lifecycle::Committed(tc),
                CommitOutcome::Aborted => Lifecycle::Aborted,
            };
            Arc::clone(&status.completion)
        };
        let (lock, cvar) = &*completion;
        *lock.lock() = true;
        cvar.notify_all();
        Ok(())
    }

    pub fn set_mvv_count(&self, start_ts: i64, count: u32) {
        if let Some(status) = self.statuses.lock().get_mut(&start_ts) {
            status.mvv_count = count;
        }
    }

    /// `commitStatus(vh, snapshotTs, step)`. `step` is accepted for the
    /// "same transaction sees its own earlier steps only" rule but is
    /// otherwise opaque to the index (the Exchange layer interprets it).
    pub fn commit_status(&self, vh: VersionHandle, snapshot_ts: i64, _step: u32) -> CommitStatus {
        if vh == PRIMORDIAL {
            return CommitStatus::Primordial;
        }
        let owner_ts = vh as i64;
        if owner_ts == snapshot_ts {
            return CommitStatus::CommittedAt(snapshot_ts);
        }
        match self.statuses.lock().get(&owner_ts) {
            None => CommitStatus::Aborted, // swept or never registered: treat as resolved-invisible
            Some(status) => match status.lifecycle {
                Lifecycle::Registered | Lifecycle::Committing => CommitStatus::Uncommitted,
                Lifecycle::Committed(tc) => CommitStatus::CommittedAt(tc),
                Lifecycle::Aborted => CommitStatus::Aborted,
            },
        }
    }

    /// Snapshot visibility rule: is `vh` visible to a reader whose
    /// transaction started at `snapshot_ts` and whose own transaction
    /// is `reader_start_ts`?
    pub fn is_visible(&self, vh: VersionHandle, reader_start_ts: i64, snapshot_ts: i64) -> bool {
        if vh == PRIMORDIAL {
            return true;
        }
        let owner_ts = vh as i64;
        if owner_ts == reader_start_ts {
            return true;
        }
        match self.commit_status(vh, snapshot_ts, 0) {
            CommitStatus::CommittedAt(tc) => tc <= snapshot_ts,
            CommitStatus::Primordial => true,
            CommitStatus::Aborted | CommitStatus::Uncommitted => false,
        }
    }

    /// `wwDependency(vh, s, timeoutMillis)`: blocks the caller until
    /// the owner of `vh` completes, the timeout elapses, or the owner
    /// is already done. Deadlocks are prevented purely by this
    /// timeout, never by cycle detection.
    pub fn ww_dependency(&self, vh: VersionHandle, timeout: Duration) -> WwOutcome {
        if vh == PRIMORDIAL {
            return WwOutcome::Primordial;
        }
        let owner_ts = vh as i64;
        let completion = {
            let statuses = self.statuses.lock();
            match statuses.get(&owner_ts) {
                None => return WwOutcome::Aborted,
                Some(status) => match status.lifecycle {
                    Lifecycle::Committed(tc) => return WwOutcome::CommittedAt(tc),
                    Lifecycle::Aborted => return WwOutcome::Aborted,
                    Lifecycle::Registered | Lifecycle::Committing => Arc::clone(&status.completion),
                },
            }
        };

        let (lock, cvar) = &*completion;
        let mut done = lock.lock();
        let deadline = Instant::now() + timeout;
        while !*done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WwOutcome::TimedOut;
            }
            let result = cvar.wait_for(&mut done, remaining);
            if result.timed_out() {
                return WwOutcome::TimedOut;
            }
        }
        drop(done);

        let statuses = self.statuses.lock();
        match statuses.get(&owner_ts).map(|s| s.lifecycle) {
            Some(Lifecycle::Committed(tc)) => WwOutcome::CommittedAt(tc),
            _ => WwOutcome::Aborted,
        }
    }

    /// Count of transactions still registered (active or committing).
    pub fn active_count(&self) -> usize {
        self.statuses
            .lock()
            .values()
            .filter(|s| matches!(s.lifecycle, Lifecycle::Registered | Lifecycle::Committing))
            .count()
    }

    /// Lowest start timestamp of any still-active transaction, i.e. the
    /// floor below which `pruneMvvValues` may safely reclaim versions.
    pub fn earliest_active_start(&self) -> Option<i64> {
        self.statuses
            .lock()
            .values()
            .filter(|s| matches!(s.lifecycle, Lifecycle::Registered | Lifecycle::Committing))
            .map(|s| s.start_ts)
            .min()
    }

    /// `cleanup()`: eagerly applies the bug-914474 retention rule — a
    /// completed status is freed only once no active transaction
    /// started before it *and* its mvv_count has reached zero.
    pub fn cleanup(&self) {
        let floor = self.earliest_active_start();
        let mut statuses = self.statuses.lock();
        statuses.retain(|_, status| {
            let completed = matches!(status.lifecycle, Lifecycle::Committed(_) | Lifecycle::Aborted);
            if !completed {
                return true;
            }
            if status.mvv_count != 0 {
                return true;
            }
            match floor {
                Some(floor_ts) => status.start_ts >= floor_ts,
                None => false,
            }
        });
    }

    pub fn status_count(&self) -> usize {
        self.statuses.lock().len()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CommitOutcome {
    Committed(i64),
    Aborted,
}
