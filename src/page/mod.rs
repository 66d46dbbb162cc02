//! The `Buffer` page format: prefix-compressed key blocks over a
//! growable tail area, with an MVV-aware value slot and a sibling
//! pointer for leaf chaining.
//!
//! Entries are kept fully materialized in memory (`Vec<Entry>`, sorted
//! by key) rather than as a literal byte-for-byte simulation of the
//! on-disk key-block array; `encode`/`decode` translate between that
//! logical form and the on-disk layout (header, key-block array, tail
//! storage), while `findKey`/`putValue`/`split`/`join`/pruning work
//! against the logical form for clarity.

pub mod fast_index;
pub mod mvv;
pub mod split_join;

use std::convert::TryInto;

use crate::error::{PersistitError, PtResult};
use crate::key::Key;

use fast_index::FastIndex;

/// Valid on-disk page sizes.
pub const PAGE_SIZES: [usize; 5] = [1024, 2048, 4096, 8192, 16384];

/// Fixed page header: type, right-sibling pointer, key-block-end
/// offset, available-space counter, mvv-count, timestamp, generation.
pub const HEADER_SIZE: usize = 32;

/// Fixed width of one key block: elided count (u16) + discriminator
/// byte (u8) + tail offset (u16).
pub const KEY_BLOCK_SIZE: usize = 5;

/// Page address 0 is reserved for the volume head page.
pub const HEAD_PAGE_ADDRESS: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Data = 0,
    Index = 1,
    LongRecord = 2,
    Garbage = 3,
    Head = 4,
}

impl PageType {
    fn from_u8(v: u8) -> PtResult<Self> {
        match v {
            0 => Ok(PageType::Data),
            1 => Ok(PageType::Index),
            2 => Ok(PageType::LongRecord),
            3 => Ok(PageType::Garbage),
            4 => Ok(PageType::Head),
            other => Err(PersistitError::corruption(
                "<page>",
                format!("invalid page-type byte: {}", other),
            )),
        }
    }
}

/// The value or pointer stored in a key block's tail region.
#[derive(Debug, Clone, PartialEq)]
pub enum TailContent {
    /// A value, possibly MVV-encoded (see `page::mvv`).
    Value(Vec<u8>),
    /// Head record of a long-record chain: page count, first page of
    /// the chain, and the full (unchunked) value length.
    LongRecord {
        page_count: u32,
        first_page: u32,
        full_length: u64,
        mvv: bool,
    },
    /// Child page pointer, used on index (non-leaf) pages.
    Child(u32),
}

impl TailContent {
    fn encoded_len(&self) -> usize {
        match self {
            TailContent::Value(v) => 1 + 2 + v.len(),
            TailContent::LongRecord { .. } => 1 + 4 + 4 + 8 + 1,
            TailContent::Child(_) => 1 + 4,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            TailContent::Value(v) => {
                out.push(0);
                out.extend_from_slice(&(v.len() as u16).to_be_bytes());
                out.extend_from_slice(v);
            }
            TailContent::LongRecord {
                page_count,
                first_page,
                full_length,
                mvv,
            } => {
                out.push(1);
                out.extend_from_slice(&page_count.to_be_bytes());
                out.extend_from_slice(&first_page.to_be_bytes());
                out.extend_from_slice(&full_length.to_be_bytes());
                out.push(if *mvv { 1 } else { 0 });
            }
            TailContent::Child(pid) => {
                out.push(2);
                out.extend_from_slice(&pid.to_be_bytes());
            }
        }
    }

    fn decode(buf: &[u8]) -> PtResult<(Self, usize)> {
        let tag = *buf
            .first()
            .ok_or_else(|| PersistitError::corruption("<page>", "truncated tail entry"))?;
        match tag {
            0 => {
                let len = u16::from_be_bytes(buf[1..3].try_into().unwrap()) as usize;
                let value = buf[3..3 + len].to_vec();
                Ok((TailContent::Value(value), 3 + len))
            }
            1 => {
                let page_count = u32::from_be_bytes(buf[1..5].try_into().unwrap());
                let first_page = u32::from_be_bytes(buf[5..9].try_into().unwrap());
                let full_length = u64::from_be_bytes(buf[9..17].try_into().unwrap());
                let mvv = buf[17] != 0;
                Ok((
                    TailContent::LongRecord {
                        page_count,
                        first_page,
                        full_length,
                        mvv,
                    },
                    18,
                ))
            }
            2 => {
                let pid = u32::from_be_bytes(buf[1..5].try_into().unwrap());
                Ok((TailContent::Child(pid), 5))
            }
            other => Err(PersistitError::corruption(
                "<page>",
                format!("invalid tail-content tag: {}", other),
            )),
        }
    }

    pub fn is_mvv_value(&self) -> bool {
        matches!(self, TailContent::Value(v) if mvv::is_mvv(v))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Key,
    pub tail: TailContent,
}

fn entry_encoded_size(e: &Entry, elided: usize) -> usize {
    KEY_BLOCK_SIZE + 2 + (e.key.bytes().len() - elided) + e.tail.encoded_len()
}

/// Result of `findKey`: whether the key matched exactly, the
/// insertion/position index, whether a neighbour's elided count must
/// be rebuilt (`fixup_required`), and the discriminator byte /
/// shared-prefix depth relative to the preceding key.
#[derive(Debug, Clone, PartialEq)]
pub struct FindKeyResult {
    pub exact: bool,
    pub index: usize,
    pub fixup_required: bool,
    pub discriminator: u8,
    pub elided: usize,
}

/// In-memory image of one page.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub page_size: usize,
    pub page_type: PageType,
    pub right_sibling: u32,
    pub timestamp: i64,
    pub generation: u64,
    entries: Vec<Entry>,
    mvv_count: u32,
    fast_index: FastIndex,
}

impl Buffer {
    pub fn new(page_size: usize, page_type: PageType) -> PtResult<Self> {
        if !PAGE_SIZES.contains(&page_size) {
            return Err(PersistitError::Configuration(format!(
                "{} is not a valid page size",
                page_size
            )));
        }
        Ok(Buffer {
            page_size,
            page_type,
            right_sibling: 0,
            timestamp: 0,
            generation: 0,
            entries: Vec::new(),
            mvv_count: 0,
            fast_index: FastIndex::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn mvv_count(&self) -> u32 {
        self.mvv_count
    }

    /// Bytes still free for new key blocks + tail content.
    pub fn available_space(&self) -> usize {
        let used: usize = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let elided = if i == 0 {
                    0
                } else {
                    self.entries[i - 1].key.shared_prefix_len(&e.key)
                };
                entry_encoded_size(e, elided)
            })
            .sum();
        self.page_size.saturating_sub(HEADER_SIZE + used)
    }

    fn elided_for(&self, index: usize, key: &Key) -> usize {
        if index == 0 {
            0
        } else {
            self.entries[index - 1].key.shared_prefix_len(key)
        }
    }

    /// Binary search over key blocks. Decoding full
    /// keys from elided counts is implicit here since entries are
    /// kept fully materialized; the Fast Index exists to skip that
    /// reconstruction work for repeated or ordered lookups.
    pub fn find_key(&self, key: &Key) -> FindKeyResult {
        let idx = self.entries.partition_point(|e| &e.key < key);
        let exact = idx < self.entries.len() && &self.entries[idx].key == key;
        let elided = self.elided_for(idx, key);
        let discriminator = key.bytes().get(elided).copied().unwrap_or(0);
        FindKeyResult {
            exact,
            index: idx,
            fixup_required: idx < self.entries.len(),
            discriminator,
            elided,
        }
    }

    /// Inserts or replaces `key`. Returns the insert position, or
    /// `InsufficientCapacity` if the page has no room even after the
    /// caller's reorganisation policy (the page itself does no
    /// reorganisation beyond prefix recompression of the neighbour).
    pub fn put_value(&mut self, key: Key, tail: TailContent) -> PtResult<usize> {
        let found = self.find_key(&key);
        let extra = if found.exact {
            let old = entry_encoded_size(&self.entries[found.index], found.elided);
            let new = entry_encoded_size(
                &Entry {
                    key: key.clone(),
                    tail: tail.clone(),
                },
                found.elided,
            );
            new.saturating_sub(old)
        } else {
            let next_elided_before = if found.index < self.entries.len() {
                self.elided_for(found.index, &self.entries[found.index].key.clone())
            } else {
                0
            };
            let new_entry_size = entry_encoded_size(
                &Entry {
                    key: key.clone(),
                    tail: tail.clone(),
                },
                found.elided,
            );
            // inserting can only shrink the next entry's elided count
            // relative to its old predecessor, never grow it, so this
            // is a conservative (over-)estimate of the worst case.
            let _ = next_elided_before;
            new_entry_size
        };

        if extra > self.available_space() {
            return Err(PersistitError::InsufficientCapacity {
                needed: extra,
                available: self.available_space(),
            });
        }

        if found.exact {
            self.entries[found.index].tail = tail;
        } else {
            self.entries.insert(found.index, Entry { key, tail });
        }
        self.fast_index.invalidate();
        self.recount_mvv();
        Ok(found.index)
    }

    /// Removes key blocks `[from, to)`. The block now adjacent to the
    /// removed range gets its elided count implicitly rebuilt the
    /// next time it is compared against its new predecessor, since
    /// elision is derived on the fly rather than cached per entry.
    pub fn remove_keys(&mut self, from: usize, to: usize) -> PtResult<()> {
        if from > to || to > self.entries.len() {
            return Err(PersistitError::fatal(format!(
                "remove_keys({}, {}) out of range for {} entries",
                from,
                to,
                self.entries.len()
            )));
        }
        self.entries.drain(from..to);
        self.fast_index.invalidate();
        self.recount_mvv();
        Ok(())
    }

    /// Reconstructs the key at `at` by walking one block left; trivial
    /// here since entries are materialized, but kept as a named
    /// operation to give a stable seam for range-delete and
    /// deep-traversal code.
    pub fn previous_key(&self, at: usize) -> Option<&Key> {
        if at == 0 || at > self.entries.len() {
            None
        } else {
            Some(&self.entries[at - 1].key)
        }
    }

    fn recount_mvv(&mut self) {
        self.mvv_count = self
            .entries
            .iter()
            .filter(|e| e.tail.is_mvv_value())
            .count() as u32;
    }

    /// Physically reclaims obsolete versions from every MVV-tailed
    /// entry on this page. Returns the total bytes reclaimed across
    /// all entries.
    pub fn prune_mvv_values(&mut self, floor: u64) -> PtResult<usize> {
        let mut reclaimed = 0;
        for entry in &mut self.entries {
            if let TailContent::Value(raw) = &mut entry.tail {
                if mvv::is_mvv(raw) {
                    reclaimed += mvv::prune_versions(raw, floor)?;
                }
            }
        }
        Ok(reclaimed)
    }

    pub fn rebuild_fast_index(&mut self) {
        let keys = self.entries.iter().map(|e| e.key.bytes().to_vec()).collect();
        self.fast_index.rebuild(keys);
    }

    pub fn fast_index(&self) -> &FastIndex {
        &self.fast_index
    }

    /// Serializes the page to its on-disk byte layout: fixed header,
    /// key-block array growing from the low end, tail storage growing
    /// down from the high end.
    pub fn encode(&self) -> PtResult<Vec<u8>> {
        let mut out = vec![0u8; self.page_size];
        out[0] = self.page_type as u8;
        out[2..4].copy_from_slice(&(self.entries.len() as u16).to_be_bytes());
        out[8..12].copy_from_slice(&self.right_sibling.to_be_bytes());
        out[12..20].copy_from_slice(&self.timestamp.to_be_bytes());
        out[20..28].copy_from_slice(&self.generation.to_be_bytes());

        let mut tail_cursor = self.page_size;
        let mut tail_bytes: Vec<(usize, Vec<u8>)> = Vec::with_capacity(self.entries.len());
        for (i, e) in self.entries.iter().enumerate() {
            let elided = self.elided_for(i, &e.key);
            let suffix = &e.key.bytes()[elided..];
            let mut chunk = Vec::with_capacity(2 + suffix.len() + e.tail.encoded_len());
            chunk.extend_from_slice(&(suffix.len() as u16).to_be_bytes());
            chunk.extend_from_slice(suffix);
            e.tail.encode(&mut chunk);
            tail_cursor = tail_cursor
                .checked_sub(chunk.len())
                .ok_or_else(|| PersistitError::fatal("page overflow during encode"))?;
            tail_bytes.push((tail_cursor, chunk));
        }

        let key_block_start = HEADER_SIZE;
        for (i, e) in self.entries.iter().enumerate() {
            let elided = self.elided_for(i, &e.key);
            let discriminator = e.key.bytes().get(elided).copied().unwrap_or(0);
            let (tail_offset, _) = tail_bytes[i];
            let base = key_block_start + i * KEY_BLOCK_SIZE;
            if base + KEY_BLOCK_SIZE > tail_cursor {
                return Err(PersistitError::InsufficientCapacity {
                    needed: base + KEY_BLOCK_SIZE,
                    available: tail_cursor,
                });
            }
            out[base..base + 2].copy_from_slice(&(elided as u16).to_be_bytes());
            out[base + 2] = discriminator;
            out[base + 3..base + 5].copy_from_slice(&(tail_offset as u16).to_be_bytes());
        }
        for (offset, chunk) in &tail_bytes {
            out[*offset..*offset + chunk.len()].copy_from_slice(chunk);
        }

        let key_block_end = key_block_start + self.entries.len() * KEY_BLOCK_SIZE;
        out[4..6].copy_from_slice(&(key_block_end as u16).to_be_bytes());
        let available = self.page_size.saturating_sub(key_block_end + (self.page_size - tail_cursor));
        out[6..8].copy_from_slice(&(available.min(u16::MAX as usize) as u16).to_be_bytes());
        out[28..32].copy_from_slice(&self.mvv_count.to_be_bytes());

        Ok(out)
    }

    pub fn decode(page_size: usize, bytes: &[u8]) -> PtResult<Self> {
        if bytes.len() != page_size {
            return Err(PersistitError::corruption(
                "<page>",
                format!("expected {} bytes, got {}", page_size, bytes.len()),
            ));
        }
        let page_type = PageType::from_u8(bytes[0])?;
        let key_count = u16::from_be_bytes(bytes[2..4].try_into().unwrap()) as usize;
        let right_sibling = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let timestamp = i64::from_be_bytes(bytes[12..20].try_into().unwrap());
        let generation = u64::from_be_bytes(bytes[20..28].try_into().unwrap());

        let mut entries = Vec::with_capacity(key_count);
        let mut previous_key: Vec<u8> = Vec::new();
        for i in 0..key_count {
            let base = HEADER_SIZE + i * KEY_BLOCK_SIZE;
            if base + KEY_BLOCK_SIZE > bytes.len() {
                return Err(PersistitError::corruption("<page>", "key block array overruns page"));
            }
            let elided = u16::from_be_bytes(bytes[base..base + 2].try_into().unwrap()) as usize;
            let _discriminator = bytes[base + 2];
            let tail_offset =
                u16::from_be_bytes(bytes[base + 3..base + 5].try_into().unwrap()) as usize;

            if elided > previous_key.len() {
                return Err(PersistitError::corruption(
                    "<page>",
                    "elided byte count exceeds previous key length",
                ));
            }
            let suffix_len_pos = tail_offset;
            if suffix_len_pos + 2 > bytes.len() {
                return Err(PersistitError::corruption("<page>", "tail pointer out of range"));
            }
            let suffix_len =
                u16::from_be_bytes(bytes[suffix_len_pos..suffix_len_pos + 2].try_into().unwrap())
                    as usize;
            let suffix_start = suffix_len_pos + 2;
            let suffix_end = suffix_start + suffix_len;
            if suffix_end > bytes.len() {
                return Err(PersistitError::corruption("<page>", "key suffix overruns page"));
            }
            let mut full_key = previous_key[..elided].to_vec();
            full_key.extend_from_slice(&bytes[suffix_start..suffix_end]);

            let (tail, _consumed) = TailContent::decode(&bytes[suffix_end..])?;

            previous_key = full_key.clone();
            entries.push(Entry {
                key: Key::new(full_key),
                tail,
            });
        }

        for w in entries.windows(2) {
            if w[0].key >= w[1].key {
                return Err(PersistitError::corruption(
                    "<page>",
                    "key blocks are not strictly increasing",
                ));
            }
        }

        let mvv_count = entries.iter().filter(|e| e.tail.is_mvv_value()).count() as u32;

        Ok(Buffer {
            page_size,
            page_type,
            right_sibling,
            timestamp,
            generation,
            entries,
            mvv_count,
            fast_index: FastIndex::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(bytes: &[u8]) -> TailContent {
        TailContent::Value(bytes.to_vec())
    }

    #[test]
    fn keys_stay_sorted_after_inserts() {
        let mut page = Buffer::new(4096, PageType::Data).unwrap();
        for k in ["mango", "apple", "cherry", "banana"] {
            page.put_value(Key::from(k), value(k.as_bytes())).unwrap();
        }
        let keys: Vec<_> = page.entries().iter().map(|e| e.key.bytes().to_vec()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn put_value_replaces_existing_key() {
        let mut page = Buffer::new(4096, PageType::Data).unwrap();
        page.put_value(Key::from("k"), value(b"v1")).unwrap();
        page.put_value(Key::from("k"), value(b"v2")).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.entries()[0].tail, value(b"v2"));
    }

    #[test]
    fn remove_keys_shrinks_range() {
        let mut page = Buffer::new(4096, PageType::Data).unwrap();
        for k in 0..10u8 {
            page.put_value(Key::from(vec![k]), value(&[k])).unwrap();
        }
        page.remove_keys(2, 5).unwrap();
        assert_eq!(page.len(), 7);
        let keys: Vec<u8> = page.entries().iter().map(|e| e.key.bytes()[0]).collect();
        assert_eq!(keys, vec![0, 1, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut page = Buffer::new(4096, PageType::Data).unwrap();
        page.timestamp = 42;
        page.right_sibling = 7;
        for k in ["aaa", "aab", "abc", "b"] {
            page.put_value(Key::from(k), value(k.as_bytes())).unwrap();
        }
        let bytes = page.encode().unwrap();
        let decoded = Buffer::decode(4096, &bytes).unwrap();
        assert_eq!(decoded.timestamp, 42);
        assert_eq!(decoded.right_sibling, 7);
        assert_eq!(decoded.entries(), page.entries());
    }

    #[test]
    fn find_key_reports_exact_and_insertion_point() {
        let mut page = Buffer::new(4096, PageType::Data).unwrap();
        for k in ["a", "c", "e"] {
            page.put_value(Key::from(k), value(b"x")).unwrap();
        }
        let hit = page.find_key(&Key::from("c"));
        assert!(hit.exact);
        assert_eq!(hit.index, 1);

        let miss = page.find_key(&Key::from("b"));
        assert!(!miss.exact);
        assert_eq!(miss.index, 1);
    }

    #[test]
    fn rejects_invalid_page_size() {
        assert!(Buffer::new(777, PageType::Data).is_err());
    }

    #[test]
    fn mvv_count_tracks_mvv_values() {
        let mut page = Buffer::new(4096, PageType::Data).unwrap();
        let mut mvv_buf = Vec::new();
        mvv::store_version(&mut mvv_buf, 1, b"v", 256).unwrap();
        page.put_value(Key::from("k1"), TailContent::Value(mvv_buf)).unwrap();
        page.put_value(Key::from("k2"), value(b"plain")).unwrap();
        assert_eq!(page.mvv_count(), 1);
    }

    #[test]
    fn pruning_reclaims_space_from_superseded_versions_across_the_page() {
        let mut page = Buffer::new(4096, PageType::Data).unwrap();
        let mut mvv_buf = Vec::new();
        mvv::store_version(&mut mvv_buf, 5, b"old", 256).unwrap();
        mvv::store_version(&mut mvv_buf, 15, b"new", 256).unwrap();
        page.put_value(Key::from("k1"), TailContent::Value(mvv_buf)).unwrap();
        page.put_value(Key::from("k2"), value(b"plain")).unwrap();

        let before = page.available_space();
        let reclaimed = page.prune_mvv_values(15).unwrap();
        assert!(reclaimed > 0);
        assert!(page.available_space() > before);
        assert_eq!(mvv::fetch_version(mvv_bytes(&page, "k1"), 15).unwrap(), b"new");
        assert!(mvv::fetch_version(mvv_bytes(&page, "k1"), 5).is_err());
    }

    fn mvv_bytes<'a>(page: &'a Buffer, key: &str) -> &'a [u8] {
        match &page.entries().iter().find(|e| e.key == Key::from(key)).unwrap().tail {
            TailContent::Value(v) => v,
            _ => panic!("expected a value tail"),
        }
    }
}
