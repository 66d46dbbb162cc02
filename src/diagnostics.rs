//! Diagnostic dumps: a management interface exposing buffer-pool,
//! journal, and transaction-index statistics for operational tooling,
//! built the same way `JournalManager::describe_page_map` formats its
//! report (a multi-line string built with `write!`), so `ptctl` and
//! tests have one place to ask "what does the engine think is going
//! on".

use std::fmt::Write as _;

use crate::buffer_pool::BufferPool;
use crate::database::Database;
use crate::txn::TransactionIndex;

pub fn describe_buffer_pool(pool: &BufferPool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "buffer pool: page_size={} capacity={}", pool.page_size(), pool.capacity());
    let _ = writeln!(out, "resident pages: {}", pool.resident_count());
    let dirty = pool.dirty_pages();
    let _ = writeln!(out, "dirty pages: {}", dirty.len());
    for (addr, ts) in &dirty {
        let _ = writeln!(out, "  {:?} @ ts={}", addr, ts);
    }
    out
}

pub fn describe_transaction_index(index: &TransactionIndex) -> String {
    format!(
        "transaction index: {} active, {} tracked statuses",
        index.active_count(),
        index.status_count()
    )
}

/// A snapshot report combining every subsystem a `Database` owns,
/// minus any one volume's page contents (use `describe_buffer_pool`
/// per-volume for that).
pub fn describe_database(db: &Database) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "volumes open: {}", db.volume_count());
    out.push_str(&describe_transaction_index(&db.txn_index));
    out.push('\n');
    out.push_str(&db.journal.describe_page_map());
    out
}
