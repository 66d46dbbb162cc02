//! Journal manager: a handle-keyed struct wrapping append-only files,
//! appending self-describing records and tracking where each
//! transaction and checkpoint lives across a set of rolling
//! fixed-size journal files, plus a full (volume, page) → `PageNode`
//! chain page map with a timestamp-monotonicity invariant so recovery
//! can tell which page images are stale.

pub mod record;
pub mod recovery;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{PersistitError, PtResult};
use record::Record;

/// Bytes reserved at the end of each journal file for its `JE` record,
/// so rollover never has to split a record across files.
const JE_OVERHEAD: u64 = 64;

#[derive(Debug, Clone)]
pub struct PageNode {
    pub timestamp: i64,
    pub file_index: u64,
    pub address: u64,
}

struct JournalFile {
    file: File,
    index: u64,
    offset: u64,
}

/// Appends journal records across a sequence of fixed-size files and
/// maintains the in-memory page map used by recovery and the page
/// copier.
pub struct JournalManager {
    directory: PathBuf,
    block_size: u64,
    current: Mutex<JournalFile>,
    page_map: Mutex<HashMap<(u32, u32), Vec<PageNode>>>,
    volume_handles: Mutex<HashMap<u32, String>>,
    tree_handles: Mutex<HashMap<u32, (u32, String)>>,
    next_handle: AtomicU32,
    base_address: AtomicU64,
}

fn file_name(index: u64) -> String {
    format!("journal.{:09}", index)
}

fn global_address(file_index: u64, block_size: u64, offset: u64) -> u64 {
    file_index * block_size + offset
}

impl JournalManager {
    pub fn open(directory: impl AsRef<Path>, block_size: u64) -> PtResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let index = 0;
        let path = directory.join(file_name(index));
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        let mut offset = file.metadata()?.len();
        if offset == 0 {
            let header = Record::JournalHeader { block_size }.encode();
            file.write_all(&header)?;
            file.flush()?;
            offset = header.len() as u64;
        }

        Ok(JournalManager {
            directory,
            block_size,
            current: Mutex::new(JournalFile { file, index, offset }),
            page_map: Mutex::new(HashMap::new()),
            volume_handles: Mutex::new(HashMap::new()),
            tree_handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            base_address: AtomicU64::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn base_address(&self) -> u64 {
        self.base_address.load(Ordering::SeqCst)
    }

    /// Binds (or reuses) an integer handle for a volume name, emitting
    /// an `IV` record the first time so later records can reference
    /// the volume by a small integer instead of repeating its name.
    pub fn volume_handle(&self, volume_name: &str) -> PtResult<u32> {
        {
            let handles = self.volume_handles.lock();
            if let Some((&h, _)) = handles.iter().find(|(_, name)| name.as_str() == volume_name) {
                return Ok(h);
            }
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.volume_handles.lock().insert(handle, volume_name.to_string());
        self.write_record(&Record::VolumeHandle {
            handle,
            volume_name: volume_name.to_string(),
        })?;
        Ok(handle)
    }

    pub fn tree_handle(&self, volume_handle: u32, tree_name: &str) -> PtResult<u32> {
        {
            let handles = self.tree_handles.lock();
            if let Some((&h, _)) = handles
                .iter()
                .find(|(_, (vh, name))| *vh == volume_handle && name == tree_name)
            {
                return Ok(h);
            }
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.tree_handles
            .lock()
            .insert(handle, (volume_handle, tree_name.to_string()));
        self.write_record(&Record::TreeHandle {
            handle,
            volume_handle,
            tree_name: tree_name.to_string(),
        })?;
        Ok(handle)
    }

    /// Appends one record, rolling over to a new file first if it
    /// would not fit before `JE_OVERHEAD`. Returns the record's global
    /// address.
    pub fn write_record(&self, record: &Record) -> PtResult<u64> {
        let encoded = record.encode();
        let mut current = self.current.lock();

        if current.offset + encoded.len() as u64 + JE_OVERHEAD > self.block_size {
            self.rollover(&mut current)?;
        }

        let address = global_address(current.index, self.block_size, current.offset);
        current.file.write_all(&encoded)?;
        current.file.flush()?;
        current.offset += encoded.len() as u64;
        Ok(address)
    }

    fn rollover(&self, current: &mut JournalFile) -> PtResult<()> {
        let je = Record::JournalEnd.encode();
        current.file.write_all(&je)?;
        current.file.flush()?;

        let next_index = current.index + 1;
        let path = self.directory.join(file_name(next_index));
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;

        let header = Record::JournalHeader {
            block_size: self.block_size,
        }
        .encode();
        file.write_all(&header)?;
        let mut offset = header.len() as u64;

        // re-emit the handle tables so the new file is self-contained.
        for (&handle, name) in self.volume_handles.lock().iter() {
            let rec = Record::VolumeHandle {
                handle,
                volume_name: name.clone(),
            }
            .encode();
            file.write_all(&rec)?;
            offset += rec.len() as u64;
        }
        for (&handle, (vh, name)) in self.tree_handles.lock().iter() {
            let rec = Record::TreeHandle {
                handle,
                volume_handle: *vh,
                tree_name: name.clone(),
            }
            .encode();
            file.write_all(&rec)?;
            offset += rec.len() as u64;
        }
        file.flush()?;

        current.file = file;
        current.index = next_index;
        current.offset = offset;
        Ok(())
    }

    /// `writePageToJournal`: writes a `PA` record and updates the page
    /// map, enforcing the timestamp-monotonicity invariant (a page
    /// image older than the one already recorded for its address must
    /// never overwrite it).
    pub fn write_page_to_journal(
        &self,
        volume_handle: u32,
        page_number: u32,
        timestamp: i64,
        image: Vec<u8>,
    ) -> PtResult<()> {
        let key = (volume_handle, page_number);
        {
            let page_map = self.page_map.lock();
            if let Some(chain) = page_map.get(&key) {
                if let Some(head) = chain.first() {
                    if timestamp < head.timestamp {
                        return Err(PersistitError::fatal(format!(
                            "timestamp monotonicity violated for page ({}, {}): new={} existing head={}",
                            volume_handle, page_number, timestamp, head.timestamp
                        )));
                    }
                }
            }
        }

        let record = Record::PageImage {
            volume_handle,
            page_number,
            timestamp,
            image,
        };
        let (file_index, address) = {
            let mut current = self.current.lock();
            let encoded = record.encode();
            if current.offset + encoded.len() as u64 + JE_OVERHEAD > self.block_size {
                self.rollover(&mut current)?;
            }
            let address = global_address(current.index, self.block_size, current.offset);
            current.file.write_all(&encoded)?;
            current.file.flush()?;
            current.offset += encoded.len() as u64;
            (current.index, address)
        };

        self.page_map.lock().entry(key).or_insert_with(Vec::new).insert(
            0,
            PageNode {
                timestamp,
                file_index,
                address,
            },
        );
        Ok(())
    }

    pub fn page_node(&self, volume_handle: u32, page_number: u32) -> Option<PageNode> {
        self.page_map
            .lock()
            .get(&(volume_handle, page_number))
            .and_then(|chain| chain.first().cloned())
    }

    pub fn page_map_len(&self) -> usize {
        self.page_map.lock().len()
    }

    /// Drops page-map entries at or below `up_to_timestamp` for
    /// `(volume_handle, page_number)`, mirroring what the page copier
    /// does once it has written the image back to the volume file.
    pub fn copy_back(&self, volume_handle: u32, page_number: u32, up_to_timestamp: i64) {
        let key = (volume_handle, page_number);
        let mut page_map = self.page_map.lock();
        if let Some(chain) = page_map.get_mut(&key) {
            chain.retain(|node| node.timestamp > up_to_timestamp);
            if chain.is_empty() {
                page_map.remove(&key);
            }
        }
    }

    /// `checkpoint()`: emits a `CP` record and advances the recorded
    /// base address. Durable once this call returns, since every
    /// `write_record` flushes synchronously.
    pub fn checkpoint(&self, timestamp: i64, active_transactions: Vec<i64>) -> PtResult<u64> {
        let address = self.write_record(&Record::Checkpoint {
            timestamp,
            base_address: self.base_address(),
            active_transactions,
        })?;
        self.base_address.store(address, Ordering::SeqCst);
        Ok(address)
    }

    /// Reads every record from file 0 through the current file, in
    /// order, for recovery or diagnostics. Stops cleanly (rather than
    /// erroring) at the first undecodable tail, since that is exactly
    /// what an abruptly-ended journal looks like after a crash.
    pub fn read_all_records(&self) -> PtResult<Vec<(u64, Record)>> {
        let mut out = Vec::new();
        let last_index = self.current.lock().index;
        for index in 0..=last_index {
            let path = self.directory.join(file_name(index));
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            let mut offset = 0usize;
            while offset < bytes.len() {
                match Record::decode(&bytes[offset..]) {
                    Ok((record, consumed)) => {
                        out.push((global_address(index, self.block_size, offset as u64), record));
                        offset += consumed;
                    }
                    Err(_) => break,
                }
            }
        }
        Ok(out)
    }

    /// Human-readable dump of the page map, used by `ptctl` and tests.
    pub fn describe_page_map(&self) -> String {
        let page_map = self.page_map.lock();
        let mut lines: Vec<String> = page_map
            .iter()
            .map(|((vh, pn), chain)| {
                format!(
                    "volume={} page={} versions={} head_ts={}",
                    vh,
                    pn,
                    chain.len(),
                    chain.first().map(|n| n.timestamp).unwrap_or(-1)
                )
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_page_to_journal_tracks_page_map_newest_first() {
        let dir = tempdir().unwrap();
        let jm = JournalManager::open(dir.path(), 1 << 20).unwrap();
        jm.write_page_to_journal(1, 7, 10, vec![1, 2, 3]).unwrap();
        jm.write_page_to_journal(1, 7, 20, vec![4, 5, 6]).unwrap();

        let node = jm.page_node(1, 7).unwrap();
        assert_eq!(node.timestamp, 20);
        assert_eq!(jm.page_map_len(), 1);
    }

    #[test]
    fn timestamp_monotonicity_violation_is_fatal() {
        let dir = tempdir().unwrap();
        let jm = JournalManager::open(dir.path(), 1 << 20).unwrap();
        jm.write_page_to_journal(1, 7, 20, vec![1]).unwrap();
        let err = jm.write_page_to_journal(1, 7, 10, vec![2]).unwrap_err();
        assert!(matches!(err, PersistitError::Fatal(_)));
    }

    #[test]
    fn checkpoint_and_records_round_trip_through_read_all() {
        let dir = tempdir().unwrap();
        let jm = JournalManager::open(dir.path(), 1 << 20).unwrap();
        jm.write_record(&Record::TransactionStart { start_ts: 1 }).unwrap();
        jm.checkpoint(5, vec![1]).unwrap();

        let records: Vec<Record> = jm.read_all_records().unwrap().into_iter().map(|(_, r)| r).collect();
        assert!(records.iter().any(|r| matches!(r, Record::JournalHeader { .. })));
        assert!(records.contains(&Record::TransactionStart { start_ts: 1 }));
        assert!(records.iter().any(|r| matches!(r, Record::Checkpoint { .. })));
    }

    #[test]
    fn rollover_creates_additional_files_and_reemits_handle_tables() {
        let dir = tempdir().unwrap();
        // small block size forces rollover quickly.
        let jm = JournalManager::open(dir.path(), 300).unwrap();
        jm.volume_handle("vol-a").unwrap();
        for i in 0..20 {
            jm.write_record(&Record::TransactionStart { start_ts: i }).unwrap();
        }
        let file_count = fs::read_dir(dir.path()).unwrap().count();
        assert!(file_count > 1, "expected rollover to produce multiple journal files");

        let records: Vec<Record> = jm.read_all_records().unwrap().into_iter().map(|(_, r)| r).collect();
        let volume_handle_records = records
            .iter()
            .filter(|r| matches!(r, Record::VolumeHandle { volume_name, .. } if volume_name == "vol-a"))
            .count();
        assert!(volume_handle_records >= 2, "handle table should be re-emitted after rollover");
    }

    #[test]
    fn copy_back_prunes_page_map_up_to_timestamp() {
        let dir = tempdir().unwrap();
        let jm = JournalManager::open(dir.path(), 1 << 20).unwrap();
        jm.write_page_to_journal(1, 1, 10, vec![1]).unwrap();
        jm.write_page_to_journal(1, 1, 20, vec![2]).unwrap();
        jm.copy_back(1, 1, 10);
        let node = jm.page_node(1, 1).unwrap();
        assert_eq!(node.timestamp, 20);
        jm.copy_back(1, 1, 20);
        assert!(jm.page_node(1, 1).is_none());
    }
}
