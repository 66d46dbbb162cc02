//! Journal record framing: a small `RecordType` enum
//! (`ABORT`/`COMMIT`/`UPDATE`/`START`/`CHECKPOINT`/...), each with an
//! encode/decode impl written straight to a single growing file using
//! a "one byte tag, then a type-specific payload" scheme, plus a
//! trailing `crc32fast` checksum per record so a torn write at the
//! tail of the journal (recovery's "abrupt end" case) is detectable
//! instead of silently misparsed.

use crc32fast::Hasher;

use crate::error::{PersistitError, PtResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    PageImage = 0,      // PA
    TransactionStart = 1, // TS
    TransactionCommit = 2, // TC
    Store = 3,          // SR
    DeleteRange = 4,    // DR
    DeleteTree = 5,     // DT
    AccumulatorDelta0 = 6, // D0
    AccumulatorDelta1 = 7, // D1
    Checkpoint = 8,      // CP
    JournalHeader = 9,   // JH
    JournalEnd = 10,     // JE
    VolumeHandle = 11,   // IV
    TreeHandle = 12,     // IT
}

impl RecordTag {
    fn from_u8(v: u8) -> PtResult<Self> {
        use RecordTag::*;
        Ok(match v {
            0 => PageImage,
            1 => TransactionStart,
            2 => TransactionCommit,
            3 => Store,
            4 => DeleteRange,
            5 => DeleteTree,
            6 => AccumulatorDelta0,
            7 => AccumulatorDelta1,
            8 => Checkpoint,
            9 => JournalHeader,
            10 => JournalEnd,
            11 => VolumeHandle,
            12 => TreeHandle,
            other => {
                return Err(PersistitError::corruption(
                    "<journal>",
                    format!("unknown record tag byte {}", other),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    PageImage {
        volume_handle: u32,
        page_number: u32,
        timestamp: i64,
        image: Vec<u8>,
    },
    TransactionStart {
        start_ts: i64,
    },
    TransactionCommit {
        start_ts: i64,
        commit_ts: i64,
    },
    Store {
        start_ts: i64,
        tree_handle: u32,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    DeleteRange {
        start_ts: i64,
        tree_handle: u32,
        from_key: Vec<u8>,
        to_key: Vec<u8>,
    },
    DeleteTree {
        start_ts: i64,
        tree_handle: u32,
    },
    AccumulatorDelta {
        start_ts: i64,
        tree_handle: u32,
        index: u32,
        delta: i64,
        wide: bool, // distinguishes D0 (narrow) from D1 (wide)
    },
    Checkpoint {
        timestamp: i64,
        base_address: u64,
        active_transactions: Vec<i64>,
    },
    JournalHeader {
        block_size: u64,
    },
    JournalEnd,
    VolumeHandle {
        handle: u32,
        volume_name: String,
    },
    TreeHandle {
        handle: u32,
        volume_handle: u32,
        tree_name: String,
    },
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_be_bytes());
}
fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}
fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}
fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> PtResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(PersistitError::corruption("<journal>", "record payload truncated"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
    fn u32(&mut self) -> PtResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> PtResult<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> PtResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn bytes(&mut self) -> PtResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
    fn string(&mut self) -> PtResult<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|e| PersistitError::corruption("<journal>", e))
    }
}

impl Record {
    fn tag(&self) -> RecordTag {
        match self {
            Record::PageImage { .. } => RecordTag::PageImage,
            Record::TransactionStart { .. } => RecordTag::TransactionStart,
            Record::TransactionCommit { .. } => RecordTag::TransactionCommit,
            Record::Store { .. } => RecordTag::Store,
            Record::DeleteRange { .. } => RecordTag::DeleteRange,
            Record::DeleteTree { .. } => RecordTag::DeleteTree,
            Record::AccumulatorDelta { wide, .. } => {
                if *wide {
                    RecordTag::AccumulatorDelta1
                } else {
                    RecordTag::AccumulatorDelta0
                }
            }
            Record::Checkpoint { .. } => RecordTag::Checkpoint,
            Record::JournalHeader { .. } => RecordTag::JournalHeader,
            Record::JournalEnd => RecordTag::JournalEnd,
            Record::VolumeHandle { .. } => RecordTag::VolumeHandle,
            Record::TreeHandle { .. } => RecordTag::TreeHandle,
        }
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Record::PageImage {
                volume_handle,
                page_number,
                timestamp,
                image,
            } => {
                put_u32(buf, *volume_handle);
                put_u32(buf, *page_number);
                put_i64(buf, *timestamp);
                put_bytes(buf, image);
            }
            Record::TransactionStart { start_ts } => put_i64(buf, *start_ts),
            Record::TransactionCommit { start_ts, commit_ts } => {
                put_i64(buf, *start_ts);
                put_i64(buf, *commit_ts);
            }
            Record::Store {
                start_ts,
                tree_handle,
                key,
                value,
            } => {
                put_i64(buf, *start_ts);
                put_u32(buf, *tree_handle);
                put_bytes(buf, key);
                put_bytes(buf, value);
            }
            Record::DeleteRange {
                start_ts,
                tree_handle,
                from_key,
                to_key,
            } => {
                put_i64(buf, *start_ts);
                put_u32(buf, *tree_handle);
                put_bytes(buf, from_key);
                put_bytes(buf, to_key);
            }
            Record::DeleteTree { start_ts, tree_handle } => {
                put_i64(buf, *start_ts);
                put_u32(buf, *tree_handle);
            }
            Record::AccumulatorDelta {
                start_ts,
                tree_handle,
                index,
                delta,
                ..
            } => {
                put_i64(buf, *start_ts);
                put_u32(buf, *tree_handle);
                put_u32(buf, *index);
                put_i64(buf, *delta);
            }
            Record::Checkpoint {
                timestamp,
                base_address,
                active_transactions,
            } => {
                put_i64(buf, *timestamp);
                put_u64(buf, *base_address);
                put_u32(buf, active_transactions.len() as u32);
                for ts in active_transactions {
                    put_i64(buf, *ts);
                }
            }
            Record::JournalHeader { block_size } => put_u64(buf, *block_size),
            Record::JournalEnd => {}
            Record::VolumeHandle { handle, volume_name } => {
                put_u32(buf, *handle);
                put_str(buf, volume_name);
            }
            Record::TreeHandle {
                handle,
                volume_handle,
                tree_name,
            } => {
                put_u32(buf, *handle);
                put_u32(buf, *volume_handle);
                put_str(buf, tree_name);
            }
        }
    }

    /// `tag byte + u32 payload length + payload + u32 crc32` of the
    /// tag byte and payload together.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);

        let mut framed = Vec::with_capacity(1 + 4 + payload.len() + 4);
        framed.push(self.tag() as u8);
        put_u32(&mut framed, payload.len() as u32);
        framed.extend_from_slice(&payload);

        let mut hasher = Hasher::new();
        hasher.update(&framed);
        let crc = hasher.finalize();
        framed.extend_from_slice(&crc.to_be_bytes());
        framed
    }

    /// Decodes exactly one record starting at `bytes[0]`, returning it
    /// and the number of bytes consumed. A checksum mismatch or
    /// truncated trailer is reported as `Corruption`, letting recovery
    /// treat it as "journal ends here" rather than panicking.
    pub fn decode(bytes: &[u8]) -> PtResult<(Self, usize)> {
        if bytes.len() < 5 {
            return Err(PersistitError::corruption("<journal>", "record header truncated"));
        }
        let tag = RecordTag::from_u8(bytes[0])?;
        let len = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
        let frame_len = 5 + len;
        if bytes.len() < frame_len + 4 {
            return Err(PersistitError::corruption("<journal>", "record body or crc truncated"));
        }
        let expected_crc = u32::from_be_bytes(bytes[frame_len..frame_len + 4].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..frame_len]);
        if hasher.finalize() != expected_crc {
            return Err(PersistitError::corruption("<journal>", "record checksum mismatch"));
        }

        let mut cursor = Cursor {
            buf: &bytes[5..frame_len],
            pos: 0,
        };
        let record = match tag {
            RecordTag::PageImage => Record::PageImage {
                volume_handle: cursor.u32()?,
                page_number: cursor.u32()?,
                timestamp: cursor.i64()?,
                image: cursor.bytes()?,
            },
            RecordTag::TransactionStart => Record::TransactionStart {
                start_ts: cursor.i64()?,
            },
            RecordTag::TransactionCommit => Record::TransactionCommit {
                start_ts: cursor.i64()?,
                commit_ts: cursor.i64()?,
            },
            RecordTag::Store => Record::Store {
                start_ts: cursor.i64()?,
                tree_handle: cursor.u32()?,
                key: cursor.bytes()?,
                value: cursor.bytes()?,
            },
            RecordTag::DeleteRange => Record::DeleteRange {
                start_ts: cursor.i64()?,
                tree_handle: cursor.u32()?,
                from_key: cursor.bytes()?,
                to_key: cursor.bytes()?,
            },
            RecordTag::DeleteTree => Record::DeleteTree {
                start_ts: cursor.i64()?,
                tree_handle: cursor.u32()?,
            },
            RecordTag::AccumulatorDelta0 | RecordTag::AccumulatorDelta1 => Record::AccumulatorDelta {
                start_ts: cursor.i64()?,
                tree_handle: cursor.u32()?,
                index: cursor.u32()?,
                delta: cursor.i64()?,
                wide: tag == RecordTag::AccumulatorDelta1,
            },
            RecordTag::Checkpoint => {
                let timestamp = cursor.i64()?;
                let base_address = cursor.u64()?;
                let n = cursor.u32()? as usize;
                let mut active_transactions = Vec::with_capacity(n);
                for _ in 0..n {
                    active_transactions.push(cursor.i64()?);
                }
                Record::Checkpoint {
                    timestamp,
                    base_address,
                    active_transactions,
                }
            }
            RecordTag::JournalHeader => Record::JournalHeader {
                block_size: cursor.u64()?,
            },
            RecordTag::JournalEnd => Record::JournalEnd,
            RecordTag::VolumeHandle => Record::VolumeHandle {
                handle: cursor.u32()?,
                volume_name: cursor.string()?,
            },
            RecordTag::TreeHandle => Record::TreeHandle {
                handle: cursor.u32()?,
                volume_handle: cursor.u32()?,
                tree_name: cursor.string()?,
            },
        };
        Ok((record, frame_len + 4))
    }
}
