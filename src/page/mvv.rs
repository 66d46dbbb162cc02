//! Multi-version value encoding.
//!
//! An MVV payload is `TYPE_MVV` followed by `(versionHandle: u64 BE,
//! length: u16 BE, payload)` tuples in insertion order. A plain
//! (non-MVV) payload is any other byte sequence and represents the
//! single primordial version.

use crate::error::{PersistitError, PtResult};

/// Sentinel byte marking an MVV-encoded payload.
pub const TYPE_MVV: u8 = 0xFE;

/// Version handle of the primordial (pre-transactional) version —
/// always visible.
pub const PRIMORDIAL_VH: u64 = 0;

const VH_BYTES: usize = 8;
const LEN_BYTES: usize = 2;
const ENTRY_HEADER_BYTES: usize = VH_BYTES + LEN_BYTES;

/// The distinguished payload marking a key as deleted under its
/// version. Chosen to be a byte sequence no ordinary value encoder
/// would produce by accident.
pub const ANTI_VALUE: &[u8] = b"\0PERSISTIT-ANTI-VALUE\0";

pub fn is_anti_value(payload: &[u8]) -> bool {
    payload == ANTI_VALUE
}

/// One decoded `(versionHandle, length, offset)` entry, as passed to
/// `visit_all_versions`'s visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionEntry {
    pub version_handle: u64,
    pub length: usize,
    pub offset: usize,
}

fn parse_entries(buf: &[u8]) -> PtResult<Vec<VersionEntry>> {
    debug_assert_eq!(buf.first().copied(), Some(TYPE_MVV));
    let mut entries = Vec::new();
    let mut pos = 1usize;
    while pos + ENTRY_HEADER_BYTES <= buf.len() {
        let vh = u64::from_be_bytes(buf[pos..pos + VH_BYTES].try_into().unwrap());
        let len_pos = pos + VH_BYTES;
        let len = u16::from_be_bytes(buf[len_pos..len_pos + LEN_BYTES].try_into().unwrap()) as usize;
        let payload_offset = len_pos + LEN_BYTES;
        if payload_offset + len > buf.len() {
            return Err(PersistitError::corruption(
                "<mvv>",
                format!(
                    "truncated MVV entry at offset {}: declared length {} exceeds buffer",
                    pos, len
                ),
            ));
        }
        entries.push(VersionEntry {
            version_handle: vh,
            length: len,
            offset: payload_offset,
        });
        pos = payload_offset + len;
    }
    Ok(entries)
}

/// Appends or replaces a version. `max_capacity` bounds the resulting
/// buffer length; exceeding it fails with `InsufficientCapacity`
/// without mutating `buf`.
///
/// `buf` must either be empty (a fresh MVV value) or already begin
/// with `TYPE_MVV` — promoting a plain single-version payload into an
/// MVV encoding is the caller's (page layout's) responsibility, since
/// only it knows whether a concurrent write actually requires MVV.
pub fn store_version(buf: &mut Vec<u8>, vh: u64, src: &[u8], max_capacity: usize) -> PtResult<()> {
    if !buf.is_empty() && buf[0] != TYPE_MVV {
        return Err(PersistitError::corruption(
            "<mvv>",
            "store_version called on a non-MVV buffer",
        ));
    }

    let mut working = buf.clone();
    if working.is_empty() {
        working.push(TYPE_MVV);
        append_entry(&mut working, PRIMORDIAL_VH, &[]);
    }

    let entries = parse_entries(&working)?;
    if let Some(existing) = entries.iter().find(|e| e.version_handle == vh) {
        if existing.length == src.len() {
            let projected = working.len();
            if projected > max_capacity {
                return Err(PersistitError::InsufficientCapacity {
                    needed: projected,
                    available: max_capacity,
                });
            }
            working[existing.offset..existing.offset + existing.length].copy_from_slice(src);
        } else {
            let entry_total = ENTRY_HEADER_BYTES + existing.length;
            let entry_start = existing.offset - ENTRY_HEADER_BYTES;
            working.drain(entry_start..entry_start + entry_total);
            let projected = working.len() + ENTRY_HEADER_BYTES + src.len();
            if projected > max_capacity {
                return Err(PersistitError::InsufficientCapacity {
                    needed: projected,
                    available: max_capacity,
                });
            }
            append_entry(&mut working, vh, src);
        }
    } else {
        let projected = working.len() + ENTRY_HEADER_BYTES + src.len();
        if projected > max_capacity {
            return Err(PersistitError::InsufficientCapacity {
                needed: projected,
                available: max_capacity,
            });
        }
        append_entry(&mut working, vh, src);
    }

    *buf = working;
    Ok(())
}

fn append_entry(buf: &mut Vec<u8>, vh: u64, payload: &[u8]) {
    buf.extend_from_slice(&vh.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Copies out the payload of the version matching `vh` exactly. No
/// implicit snapshot resolution happens here: the caller (`Exchange`)
/// decides which `vh` is visible and asks for it by exact handle.
pub fn fetch_version(buf: &[u8], vh: u64) -> PtResult<Vec<u8>> {
    if buf.is_empty() {
        return Err(PersistitError::NotFound(format!("version {}", vh)));
    }
    if buf[0] != TYPE_MVV {
        return if vh == PRIMORDIAL_VH {
            Ok(buf.to_vec())
        } else {
            Err(PersistitError::NotFound(format!("version {}", vh)))
        };
    }
    let entries = parse_entries(buf)?;
    match entries.iter().find(|e| e.version_handle == vh) {
        Some(e) => Ok(buf[e.offset..e.offset + e.length].to_vec()),
        None => Err(PersistitError::NotFound(format!("version {}", vh))),
    }
}

/// Invokes `visitor(versionHandle, length, offset)` for every version
/// in encounter order.
pub fn visit_all_versions<F: FnMut(u64, usize, usize)>(buf: &[u8], mut visitor: F) -> PtResult<()> {
    if buf.is_empty() || buf[0] != TYPE_MVV {
        return Ok(());
    }
    for entry in parse_entries(buf)? {
        visitor(entry.version_handle, entry.length, entry.offset);
    }
    Ok(())
}

pub fn is_mvv(buf: &[u8]) -> bool {
    buf.first() == Some(&TYPE_MVV)
}

/// Physically discards versions no live snapshot can still read. A version below `floor` is
/// reclaimed unless it is the newest one at or below `floor` — that one
/// remains the value every snapshot in `[oldest active start, floor]`
/// still resolves to. Leaves plain (non-MVV) payloads untouched.
/// Returns the number of bytes reclaimed.
pub fn prune_versions(buf: &mut Vec<u8>, floor: u64) -> PtResult<usize> {
    if buf.is_empty() || buf[0] != TYPE_MVV {
        return Ok(0);
    }
    let entries = parse_entries(buf)?;
    let floor_version = entries
        .iter()
        .filter(|e| e.version_handle <= floor)
        .map(|e| e.version_handle)
        .max();

    let before_len = buf.len();
    let mut rebuilt = Vec::with_capacity(before_len);
    rebuilt.push(TYPE_MVV);
    for entry in &entries {
        let keep = entry.version_handle > floor || Some(entry.version_handle) == floor_version;
        if keep {
            append_entry(&mut rebuilt, entry.version_handle, &buf[entry.offset..entry.offset + entry.length]);
        }
    }

    let reclaimed = before_len.saturating_sub(rebuilt.len());
    *buf = rebuilt;
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_into_empty_buffer_produces_the_tagged_entry_byte_layout() {
        let mut buf = Vec::new();
        store_version(&mut buf, 200, &[0xA, 0xB, 0xC], 4096).unwrap();

        assert_eq!(buf[0], TYPE_MVV);
        // sentinel (vh=0, len=0)
        assert_eq!(&buf[1..9], &0u64.to_be_bytes());
        assert_eq!(&buf[9..11], &0u16.to_be_bytes());
        // (vh=200, len=3, payload)
        assert_eq!(&buf[11..19], &200u64.to_be_bytes());
        assert_eq!(&buf[19..21], &3u16.to_be_bytes());
        assert_eq!(&buf[21..24], &[0xA, 0xB, 0xC]);
        assert_eq!(buf.len(), 24);
    }

    #[test]
    fn fetch_returns_last_write_for_repeated_vh() {
        let mut buf = Vec::new();
        store_version(&mut buf, 10, b"first", 4096).unwrap();
        store_version(&mut buf, 10, b"second!", 4096).unwrap();
        assert_eq!(fetch_version(&buf, 10).unwrap(), b"second!");
    }

    #[test]
    fn mvv_round_trip_arbitrary_sequence() {
        let mut buf = Vec::new();
        let versions: Vec<(u64, &[u8])> = vec![
            (1, b"aaa"),
            (2, b"bb"),
            (3, b"c"),
            (2, b"bbbbb"), // replace vh=2 with a longer payload
        ];
        for (vh, payload) in &versions {
            store_version(&mut buf, *vh, payload, 4096).unwrap();
        }
        assert_eq!(fetch_version(&buf, 1).unwrap(), b"aaa");
        assert_eq!(fetch_version(&buf, 2).unwrap(), b"bbbbb");
        assert_eq!(fetch_version(&buf, 3).unwrap(), b"c");
        assert!(fetch_version(&buf, 999).is_err());
    }

    #[test]
    fn replacement_reorders_to_tail_when_length_changes() {
        let mut buf = Vec::new();
        store_version(&mut buf, 199, &[0, 0], 4096).unwrap();
        store_version(&mut buf, 200, &[0, 0, 0], 4096).unwrap();
        store_version(&mut buf, 201, &[0, 0, 0, 0], 4096).unwrap();

        // replacing vh=200 with a 2-byte payload changes its length,
        // so it moves behind 201.
        store_version(&mut buf, 200, &[9, 9], 4096).unwrap();
        let order: Vec<u64> = {
            let mut v = Vec::new();
            visit_all_versions(&buf, |vh, _, _| v.push(vh)).unwrap();
            v
        };
        assert_eq!(order, vec![PRIMORDIAL_VH, 199, 201, 200]);

        // replacing again with a 4-byte payload: still a different
        // length than the current 2 bytes, so it is re-appended, but
        // since it's already last, order is unchanged.
        store_version(&mut buf, 200, &[1, 2, 3, 4], 4096).unwrap();
        let order2: Vec<u64> = {
            let mut v = Vec::new();
            visit_all_versions(&buf, |vh, _, _| v.push(vh)).unwrap();
            v
        };
        assert_eq!(order2, vec![PRIMORDIAL_VH, 199, 201, 200]);
        assert_eq!(fetch_version(&buf, 200).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn store_version_fails_when_capacity_exceeded() {
        let mut buf = Vec::new();
        let err = store_version(&mut buf, 1, &[0u8; 100], 8).unwrap_err();
        assert!(matches!(err, PersistitError::InsufficientCapacity { .. }));
        assert!(buf.is_empty(), "buffer must be untouched on failure");
    }

    #[test]
    fn plain_payload_is_fetched_as_primordial() {
        let buf = b"plain-value".to_vec();
        assert_eq!(fetch_version(&buf, PRIMORDIAL_VH).unwrap(), b"plain-value");
        assert!(fetch_version(&buf, 5).is_err());
    }

    #[test]
    fn anti_value_is_recognised() {
        assert!(is_anti_value(ANTI_VALUE));
        assert!(!is_anti_value(b"not anti"));
    }

    #[test]
    fn pruning_keeps_only_the_newest_version_at_or_below_the_floor() {
        let mut buf = Vec::new();
        store_version(&mut buf, 10, b"v10", 4096).unwrap();
        store_version(&mut buf, 20, b"v20", 4096).unwrap();
        store_version(&mut buf, 30, b"v30", 4096).unwrap();

        let reclaimed = prune_versions(&mut buf, 25).unwrap();
        assert!(reclaimed > 0);

        let order: Vec<u64> = {
            let mut v = Vec::new();
            visit_all_versions(&buf, |vh, _, _| v.push(vh)).unwrap();
            v
        };
        // vh=10 is superseded by vh=20 for every snapshot <= 25; vh=0
        // (primordial) is superseded too. vh=30 is still newer than the
        // floor and stays untouched.
        assert_eq!(order, vec![20, 30]);
        assert_eq!(fetch_version(&buf, 20).unwrap(), b"v20");
        assert_eq!(fetch_version(&buf, 30).unwrap(), b"v30");
        assert!(fetch_version(&buf, 10).is_err());
    }

    #[test]
    fn pruning_a_buffer_with_nothing_below_the_floor_is_a_no_op() {
        let mut buf = Vec::new();
        store_version(&mut buf, 100, b"only", 4096).unwrap();
        let before = buf.clone();
        let reclaimed = prune_versions(&mut buf, 5).unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(buf, before);
    }

    #[test]
    fn pruning_a_plain_payload_is_a_no_op() {
        let mut buf = b"plain".to_vec();
        let reclaimed = prune_versions(&mut buf, 1000).unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(buf, b"plain".to_vec());
    }
}
