//! Volume: a named file of fixed-size pages with a head page at
//! address 0 carrying the volume's identity and allocation state, one
//! file holding many trees rather than one file per tree, opened with
//! `OpenOptions` and read/written by page-sized `seek` plus
//! `read_exact`/`write_all`, with head-page bookkeeping for the
//! next-available-page counter, garbage chain, and saved timestamp.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::buffer_pool::{PageAddress, PageStore};
use crate::error::{PersistitError, PtResult};
use crate::page::{Buffer, PageType, HEAD_PAGE_ADDRESS, PAGE_SIZES};

const MAGIC: u64 = 0x5045_5253_4953_5456; // "PERSISTV" truncated to 8 bytes

/// Page 0's fixed header: magic, page size, next free page, garbage
/// chain head, directory-tree root, saved timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeHead {
    pub magic: u64,
    pub page_size: u32,
    pub next_available_page: u32,
    pub garbage_chain_head: u32,
    pub directory_root: u32,
    pub saved_timestamp: i64,
}

impl VolumeHead {
    fn fresh(page_size: usize) -> Self {
        VolumeHead {
            magic: MAGIC,
            page_size: page_size as u32,
            next_available_page: 1,
            garbage_chain_head: 0,
            directory_root: 0,
            saved_timestamp: 0,
        }
    }

    fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut out = vec![0u8; page_size];
        out[0..8].copy_from_slice(&self.magic.to_be_bytes());
        out[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        out[12..16].copy_from_slice(&self.next_available_page.to_be_bytes());
        out[16..20].copy_from_slice(&self.garbage_chain_head.to_be_bytes());
        out[20..24].copy_from_slice(&self.directory_root.to_be_bytes());
        out[24..32].copy_from_slice(&self.saved_timestamp.to_be_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> PtResult<Self> {
        if bytes.len() < 32 {
            return Err(PersistitError::corruption("<volume>", "head page too short"));
        }
        let magic = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        if magic != MAGIC {
            return Err(PersistitError::corruption("<volume>", "bad head page magic number"));
        }
        Ok(VolumeHead {
            magic,
            page_size: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            next_available_page: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            garbage_chain_head: u32::from_be_bytes(bytes[16..20].try_into().unwrap()),
            directory_root: u32::from_be_bytes(bytes[20..24].try_into().unwrap()),
            saved_timestamp: i64::from_be_bytes(bytes[24..32].try_into().unwrap()),
        })
    }
}

/// A named, page-structured file. Page size and identity are
/// immutable after creation.
pub struct Volume {
    pub name: String,
    pub volume_id: u64,
    page_size: usize,
    file: Mutex<File>,
    next_available_page: AtomicU32,
    garbage_chain_head: AtomicU32,
    directory_root: AtomicU32,
    saved_timestamp: AtomicU64,
}

impl Volume {
    pub fn create(path: impl AsRef<Path>, volume_id: u64, page_size: usize) -> PtResult<Self> {
        if !PAGE_SIZES.contains(&page_size) {
            return Err(PersistitError::Configuration(format!("{} is not a valid page size", page_size)));
        }
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let head = VolumeHead::fresh(page_size);
        file.set_len(page_size as u64)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&head.encode(page_size))?;
        file.flush()?;

        Ok(Volume {
            name: path.to_string_lossy().into_owned(),
            volume_id,
            page_size,
            file: Mutex::new(file),
            next_available_page: AtomicU32::new(head.next_available_page),
            garbage_chain_head: AtomicU32::new(head.garbage_chain_head),
            directory_root: AtomicU32::new(head.directory_root),
            saved_timestamp: AtomicU64::new(head.saved_timestamp as u64),
        })
    }

    pub fn open(path: impl AsRef<Path>, volume_id: u64) -> PtResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header_guess = vec![0u8; 32];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_guess)?;
        let page_size = u32::from_be_bytes(header_guess[8..12].try_into().unwrap()) as usize;
        file.seek(SeekFrom::Start(0))?;
        let mut head_bytes = vec![0u8; page_size];
        file.read_exact(&mut head_bytes)?;
        let head = VolumeHead::decode(&head_bytes)?;

        Ok(Volume {
            name: path.to_string_lossy().into_owned(),
            volume_id,
            page_size,
            file: Mutex::new(file),
            next_available_page: AtomicU32::new(head.next_available_page),
            garbage_chain_head: AtomicU32::new(head.garbage_chain_head),
            directory_root: AtomicU32::new(head.directory_root),
            saved_timestamp: AtomicU64::new(head.saved_timestamp as u64),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn directory_root(&self) -> u32 {
        self.directory_root.load(Ordering::SeqCst)
    }

    pub fn set_directory_root(&self, page_number: u32) {
        self.directory_root.store(page_number, Ordering::SeqCst);
    }

    pub fn saved_timestamp(&self) -> i64 {
        self.saved_timestamp.load(Ordering::SeqCst) as i64
    }

    pub fn set_saved_timestamp(&self, ts: i64) {
        self.saved_timestamp.store(ts as u64, Ordering::SeqCst);
    }

    /// Pulls one page number from the garbage chain, or extends the
    /// file if the chain is empty.
    pub fn allocate_page_number(&self) -> u32 {
        let head = self.garbage_chain_head.load(Ordering::SeqCst);
        if head != 0 {
            // The freed page's own body stores the next link in its
            // first 4 bytes; callers reading it back via `read_raw`
            // are responsible for that convention.
            self.garbage_chain_head.store(0, Ordering::SeqCst);
            return head;
        }
        self.next_available_page.fetch_add(1, Ordering::SeqCst)
    }

    pub fn free_page_number(&self, page_number: u32) {
        self.garbage_chain_head.store(page_number, Ordering::SeqCst);
    }

    fn flush_head(&self) -> PtResult<()> {
        let head = VolumeHead {
            magic: MAGIC,
            page_size: self.page_size as u32,
            next_available_page: self.next_available_page.load(Ordering::SeqCst),
            garbage_chain_head: self.garbage_chain_head.load(Ordering::SeqCst),
            directory_root: self.directory_root.load(Ordering::SeqCst),
            saved_timestamp: self.saved_timestamp(),
        };
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&head.encode(self.page_size))?;
        file.flush()?;
        Ok(())
    }

    pub fn read_raw(&self, page_number: u32) -> PtResult<Vec<u8>> {
        let mut file = self.file.lock();
        let mut buf = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(page_number as u64 * self.page_size as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_raw(&self, page_number: u32, bytes: &[u8]) -> PtResult<()> {
        if bytes.len() != self.page_size {
            return Err(PersistitError::fatal("write_raw: page size mismatch"));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_number as u64 * self.page_size as u64))?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }
}

/// Adapts `Volume` to the buffer pool's `PageStore` seam.
pub struct VolumePageStore {
    pub volume: Volume,
}

impl PageStore for VolumePageStore {
    fn page_size(&self) -> usize {
        self.volume.page_size()
    }

    fn read_page(&self, addr: PageAddress) -> PtResult<Buffer> {
        if addr.page_number == HEAD_PAGE_ADDRESS {
            return Err(PersistitError::fatal("the head page is not a Buffer"));
        }
        let bytes = self.volume.read_raw(addr.page_number)?;
        Buffer::decode(self.volume.page_size(), &bytes)
    }

    fn write_page(&self, addr: PageAddress, page: &Buffer) -> PtResult<()> {
        let bytes = page.encode()?;
        self.volume.write_raw(addr.page_number, &bytes)?;
        self.volume.flush_head()
    }

    fn allocate_page(&self, _page_type: PageType) -> PtResult<PageAddress> {
        Ok(PageAddress {
            volume_id: self.volume.volume_id,
            page_number: self.volume.allocate_page_number(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_round_trips_head_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.vol");
        {
            let volume = Volume::create(&path, 1, 4096).unwrap();
            volume.set_directory_root(5);
            volume.set_saved_timestamp(42);
            volume.flush_head().unwrap();
        }
        let reopened = Volume::open(&path, 1).unwrap();
        assert_eq!(reopened.page_size(), 4096);
        assert_eq!(reopened.directory_root(), 5);
        assert_eq!(reopened.saved_timestamp(), 42);
    }

    #[test]
    fn page_allocation_extends_file_then_reuses_garbage_chain() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path().join("test.vol"), 1, 4096).unwrap();
        let a = volume.allocate_page_number();
        let b = volume.allocate_page_number();
        assert_ne!(a, b);
        volume.free_page_number(a);
        let reused = volume.allocate_page_number();
        assert_eq!(reused, a);
    }

    #[test]
    fn rejects_invalid_page_size() {
        let dir = tempdir().unwrap();
        assert!(Volume::create(dir.path().join("bad.vol"), 1, 777).is_err());
    }
}
