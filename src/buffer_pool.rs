//! Buffer pool: a read-through cache keying a `HashMap` by page
//! identity and handing back a claim guard, reading through to the
//! backing store on a miss. Unlike a plain "one RwLock per page, held
//! for the caller's whole critical section" cache, this exposes an
//! explicit claim/release latch protocol, an LRU eviction list bounded
//! by a configured buffer count, and a dirty-page write-back path
//! distinct from eviction.
//!
//! Page I/O is abstracted behind `PageStore` rather than calling a
//! concrete `Volume` directly, since a pool must be constructible (and
//! unit-testable) before any particular volume implementation exists.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PersistitError, PtResult};
use crate::journal::JournalManager;
use crate::page::{Buffer, PageType};

/// Identifies one page within one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageAddress {
    pub volume_id: u64,
    pub page_number: u32,
}

/// Backing store a buffer pool reads misses from and flushes dirty
/// pages to. `Volume` (not yet built) is the production implementor;
/// tests use an in-memory stand-in.
pub trait PageStore: Send + Sync {
    fn page_size(&self) -> usize;
    fn read_page(&self, addr: PageAddress) -> PtResult<Buffer>;
    fn write_page(&self, addr: PageAddress, page: &Buffer) -> PtResult<()>;
    fn allocate_page(&self, page_type: PageType) -> PtResult<PageAddress>;
}

struct Frame {
    page: Arc<RwLock<Buffer>>,
    dirty: bool,
    dirty_timestamp: i64,
    claims: u32,
}

/// A claimed frame handle. Dropping it releases the claim.
pub struct ClaimGuard<'p> {
    pool: &'p BufferPool,
    addr: PageAddress,
    pub page: Arc<RwLock<Buffer>>,
    exclusive: bool,
}

impl<'p> ClaimGuard<'p> {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl<'p> Drop for ClaimGuard<'p> {
    fn drop(&mut self) {
        self.pool.release(self.addr);
    }
}

/// A read-through, write-back cache of `Buffer` pages, bounded to a
/// fixed capacity with LRU eviction among unclaimed frames.
pub struct BufferPool {
    store: Arc<dyn PageStore>,
    capacity: usize,
    frames: RwLock<HashMap<PageAddress, Frame>>,
    lru: RwLock<Vec<PageAddress>>,
    /// Journal a dirty page is written to before it reaches the
    /// volume (`writePage` writes the journal image first); `None`
    /// only in tests that exercise the pool without a journal.
    journal: Option<(Arc<JournalManager>, u32)>,
}

impl BufferPool {
    pub fn new(store: Arc<dyn PageStore>, capacity: usize) -> Self {
        BufferPool {
            store,
            capacity: capacity.max(1),
            frames: RwLock::new(HashMap::new()),
            lru: RwLock::new(Vec::new()),
            journal: None,
        }
    }

    /// Attaches the journal a page's dirty image must reach before the
    /// volume does. `journal_volume_handle` is this pool's volume's
    /// handle in that journal's handle table.
    pub fn with_journal(mut self, journal: Arc<JournalManager>, journal_volume_handle: u32) -> Self {
        self.journal = Some((journal, journal_volume_handle));
        self
    }

    /// Writes one dirty page's image to the journal ahead of the
    /// volume, honoring the write-ahead ordering guarantee; a no-op
    /// when no journal is attached.
    fn write_ahead(&self, addr: PageAddress, frame: &Frame) -> PtResult<()> {
        if let Some((journal, volume_handle)) = &self.journal {
            let image = frame.page.read().encode()?;
            journal.write_page_to_journal(*volume_handle, addr.page_number, frame.dirty_timestamp, image)?;
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resident_count(&self) -> usize {
        self.frames.read().len()
    }

    /// Claims `addr`, reading it from the backing store on a miss
    /// (`force_read` re-reads even if already resident, used by
    /// recovery to discard a page image known to be stale).
    pub fn get(&self, addr: PageAddress, want_exclusive: bool, force_read: bool) -> PtResult<ClaimGuard<'_>> {
        {
            let mut frames = self.frames.write();
            if force_read {
                frames.remove(&addr);
            }
            if let Some(frame) = frames.get_mut(&addr) {
                frame.claims += 1;
                self.touch_lru(addr);
                return Ok(ClaimGuard {
                    pool: self,
                    addr,
                    page: Arc::clone(&frame.page),
                    exclusive: want_exclusive,
                });
            }
        }

        let page = self.store.read_page(addr)?;
        self.install(addr, page, false, 0)
    }

    /// Claims a brand-new page allocated by the backing store.
    pub fn allocate(&self, page_type: PageType) -> PtResult<(PageAddress, ClaimGuard<'_>)> {
        let addr = self.store.allocate_page(page_type)?;
        let page = Buffer::new(self.store.page_size(), page_type)?;
        let claim = self.install(addr, page, true, 0)?;
        Ok((addr, claim))
    }

    fn install(&self, addr: PageAddress, page: Buffer, dirty: bool, dirty_timestamp: i64) -> PtResult<ClaimGuard<'_>> {
        self.evict_if_needed(addr)?;
        let shared = Arc::new(RwLock::new(page));
        let mut frames = self.frames.write();
        frames.insert(
            addr,
            Frame {
                page: Arc::clone(&shared),
                dirty,
                dirty_timestamp,
                claims: 1,
            },
        );
        drop(frames);
        self.touch_lru(addr);
        Ok(ClaimGuard {
            pool: self,
            addr,
            page: shared,
            exclusive: true,
        })
    }

    fn evict_if_needed(&self, incoming: PageAddress) -> PtResult<()> {
        loop {
            if self.frames.read().len() < self.capacity {
                return Ok(());
            }
            let victim = {
                let lru = self.lru.read();
                let frames = self.frames.read();
                lru.iter()
                    .find(|a| **a != incoming && frames.get(a).map(|f| f.claims == 0).unwrap_or(false))
                    .copied()
            };
            match victim {
                Some(addr) => self.evict(addr)?,
                None => return Ok(()), // pool is full of claimed pages; caller's get() will just grow by one
            }
        }
    }

    fn evict(&self, addr: PageAddress) -> PtResult<()> {
        let mut frames = self.frames.write();
        if let Some(frame) = frames.get(&addr) {
            if frame.claims > 0 {
                return Ok(());
            }
            if frame.dirty {
                self.write_ahead(addr, frame)?;
                let page = frame.page.read();
                self.store.write_page(addr, &page)?;
            }
            frames.remove(&addr);
        }
        drop(frames);
        self.lru.write().retain(|a| *a != addr);
        Ok(())
    }

    fn touch_lru(&self, addr: PageAddress) {
        let mut lru = self.lru.write();
        lru.retain(|a| *a != addr);
        lru.push(addr);
    }

    fn release(&self, addr: PageAddress) {
        let mut frames = self.frames.write();
        if let Some(frame) = frames.get_mut(&addr) {
            frame.claims = frame.claims.saturating_sub(1);
        }
    }

    /// Marks a resident page dirty at the given timestamp; the journal
    /// manager uses this timestamp to decide write-ahead ordering
    /// before eviction.
    pub fn set_dirty_at_timestamp(&self, addr: PageAddress, timestamp: i64) -> PtResult<()> {
        let mut frames = self.frames.write();
        match frames.get_mut(&addr) {
            Some(frame) => {
                frame.dirty = true;
                frame.dirty_timestamp = frame.dirty_timestamp.max(timestamp);
                Ok(())
            }
            None => Err(PersistitError::fatal(format!(
                "set_dirty_at_timestamp on non-resident page {:?}",
                addr
            ))),
        }
    }

    pub fn is_dirty(&self, addr: PageAddress) -> bool {
        self.frames.read().get(&addr).map(|f| f.dirty).unwrap_or(false)
    }

    /// Forces a write-back of one resident page without evicting it,
    /// used by the journal manager's page-copy-back cycle. Writes the
    /// journal image first, then the volume.
    pub fn write_page(&self, addr: PageAddress) -> PtResult<()> {
        let mut frames = self.frames.write();
        if let Some(frame) = frames.get_mut(&addr) {
            self.write_ahead(addr, frame)?;
            let page = frame.page.read();
            self.store.write_page(addr, &page)?;
            frame.dirty = false;
            Ok(())
        } else {
            Err(PersistitError::fatal(format!(
                "write_page on non-resident page {:?}",
                addr
            )))
        }
    }

    /// All resident dirty pages with their write-ahead timestamp, in
    /// no particular order; used by the page-copier to decide what to
    /// flush next.
    pub fn dirty_pages(&self) -> Vec<(PageAddress, i64)> {
        self.frames
            .read()
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(a, f)| (*a, f.dirty_timestamp))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MemStore {
        page_size: usize,
        pages: Mutex<HashMap<PageAddress, Buffer>>,
        next: Mutex<u32>,
    }

    impl MemStore {
        fn new(page_size: usize) -> Self {
            MemStore {
                page_size,
                pages: Mutex::new(HashMap::new()),
                next: Mutex::new(1),
            }
        }
    }

    impl PageStore for MemStore {
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn read_page(&self, addr: PageAddress) -> PtResult<Buffer> {
            self.pages
                .lock()
                .unwrap()
                .get(&addr)
                .cloned()
                .ok_or_else(|| PersistitError::NotFound(format!("{:?}", addr)))
        }

        fn write_page(&self, addr: PageAddress, page: &Buffer) -> PtResult<()> {
            self.pages.lock().unwrap().insert(addr, page.clone());
            Ok(())
        }

        fn allocate_page(&self, _page_type: PageType) -> PtResult<PageAddress> {
            let mut next = self.next.lock().unwrap();
            let addr = PageAddress {
                volume_id: 1,
                page_number: *next,
            };
            *next += 1;
            Ok(addr)
        }
    }

    #[test]
    fn allocate_then_get_round_trips() {
        let store = Arc::new(MemStore::new(4096));
        let pool = BufferPool::new(store, 4);
        let (addr, claim) = pool.allocate(PageType::Data).unwrap();
        claim.page.write().timestamp = 7;
        pool.set_dirty_at_timestamp(addr, 7).unwrap();
        drop(claim);

        pool.write_page(addr).unwrap();
        assert!(!pool.is_dirty(addr));

        let refetched = pool.get(addr, false, true).unwrap();
        assert_eq!(refetched.page.read().timestamp, 7);
    }

    #[test]
    fn eviction_respects_claims() {
        let store = Arc::new(MemStore::new(4096));
        let pool = BufferPool::new(store, 1);
        let (addr1, claim1) = pool.allocate(PageType::Data).unwrap();
        // addr1 still claimed; a second allocate cannot evict it, so
        // the pool temporarily holds 2 resident frames.
        let (addr2, claim2) = pool.allocate(PageType::Data).unwrap();
        assert_eq!(pool.resident_count(), 2);
        drop(claim1);
        drop(claim2);
        assert!(addr1 != addr2);
    }

    #[test]
    fn claims_are_reference_counted_by_drop() {
        let store = Arc::new(MemStore::new(4096));
        let pool = BufferPool::new(store, 4);
        let (addr, claim) = pool.allocate(PageType::Data).unwrap();
        drop(claim);
        let reclaim = pool.get(addr, true, false).unwrap();
        assert!(reclaim.is_exclusive());
    }
}
