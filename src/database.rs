//! The `Database` façade: one handle owning the catalog of open
//! volumes/trees, the buffer pool, the journal manager, and the
//! transaction index, so a `Session`/`Exchange` doesn't need every
//! subsystem threaded through every call site.
//!
//! `Database` is an explicit value a caller constructs and threads
//! through `Session::begin` rather than a process-wide global; only
//! the volume-id counter, which genuinely has no natural non-global
//! owner before any `Database` exists, lives behind a `OnceCell`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::error::PtResult;
use crate::journal::JournalManager;
use crate::tree::Tree;
use crate::txn::TransactionIndex;
use crate::volume::{Volume, VolumePageStore};

static NEXT_VOLUME_ID: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(1));

fn next_volume_id() -> u64 {
    NEXT_VOLUME_ID.fetch_add(1, Ordering::SeqCst)
}

/// One open volume: its page store-backed buffer pool plus the trees
/// created inside it, keyed by name.
pub struct OpenVolume {
    pub volume_id: u64,
    pub pool: Arc<BufferPool>,
    trees: RwLock<HashMap<String, Arc<Tree>>>,
}

pub struct Database {
    pub config: Config,
    pub journal: Arc<JournalManager>,
    pub txn_index: Arc<TransactionIndex>,
    volumes: RwLock<HashMap<String, Arc<OpenVolume>>>,
}

impl Database {
    pub fn open(config: Config, journal_directory: impl AsRef<Path>) -> PtResult<Self> {
        config.validate()?;
        let journal = Arc::new(JournalManager::open(journal_directory, config.journal_size)?);
        Ok(Database {
            config,
            journal,
            txn_index: Arc::new(TransactionIndex::new()),
            volumes: RwLock::new(HashMap::new()),
        })
    }

    /// Opens (creating if absent) a volume file and registers it.
    pub fn open_volume(&self, path: impl AsRef<Path>, page_size: usize) -> PtResult<Arc<OpenVolume>> {
        let path_ref = path.as_ref();
        let name = path_ref.to_string_lossy().into_owned();
        if let Some(existing) = self.volumes.read().get(&name) {
            return Ok(Arc::clone(existing));
        }

        let volume_id = next_volume_id();
        let volume = if path_ref.exists() {
            Volume::open(path_ref, volume_id)?
        } else {
            Volume::create(path_ref, volume_id, page_size)?
        };

        let capacity = self
            .config
            .buffer_count_for(volume.page_size())
            .unwrap_or(256);
        let store = Arc::new(VolumePageStore { volume });
        let journal_volume_handle = self.journal.volume_handle(&path_ref.to_string_lossy())?;
        let pool = Arc::new(BufferPool::new(store, capacity).with_journal(Arc::clone(&self.journal), journal_volume_handle));

        let opened = Arc::new(OpenVolume {
            volume_id,
            pool,
            trees: RwLock::new(HashMap::new()),
        });
        self.volumes.write().insert(name, Arc::clone(&opened));
        Ok(opened)
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.read().len()
    }
}

impl OpenVolume {
    /// Looks up or creates a tree by name. A brand-new tree's root is
    /// an empty data page allocated on the spot.
    pub fn tree(&self, name: &str) -> PtResult<Arc<Tree>> {
        if let Some(tree) = self.trees.read().get(name) {
            return Ok(Arc::clone(tree));
        }
        let (root_addr, _claim) = self.pool.allocate(crate::page::PageType::Data)?;
        let handle = crate::exchange::allocate_tree_handle();
        let tree = Arc::new(Tree::new(name, handle, root_addr.page_number));
        tree.activate();
        self.trees.write().insert(name.to_string(), Arc::clone(&tree));
        Ok(tree)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_volume_is_idempotent_by_path() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::default(), dir.path().join("journal")).unwrap();
        let v1 = db.open_volume(dir.path().join("v.db"), 4096).unwrap();
        let v2 = db.open_volume(dir.path().join("v.db"), 4096).unwrap();
        assert_eq!(v1.volume_id, v2.volume_id);
        assert_eq!(db.volume_count(), 1);
    }

    #[test]
    fn tree_lookup_creates_once_and_reuses() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::default(), dir.path().join("journal")).unwrap();
        let volume = db.open_volume(dir.path().join("v.db"), 4096).unwrap();
        let t1 = volume.tree("accounts").unwrap();
        let t2 = volume.tree("accounts").unwrap();
        assert_eq!(t1.handle, t2.handle);
        assert_eq!(volume.tree_count(), 1);
    }
}
