//! Key model: a sequence of unsigned bytes with strict lexicographic
//! ordering, plus the `BEFORE`/`AFTER` sentinels that compare outside
//! any real key and never materialise in storage.

use std::cmp::Ordering;
use std::fmt;

/// An ordered key, `BEFORE < any real key < AFTER`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Before,
    Real(Vec<u8>),
    After,
}

impl Key {
    pub fn new(bytes: Vec<u8>) -> Self {
        Key::Real(bytes)
    }

    pub fn empty() -> Self {
        Key::Real(Vec::new())
    }

    pub fn is_before(&self) -> bool {
        matches!(self, Key::Before)
    }

    pub fn is_after(&self) -> bool {
        matches!(self, Key::After)
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Key::Real(b) => b,
            Key::Before | Key::After => &[],
        }
    }

    /// Appends a segment to a multi-segment key. Segment boundaries
    /// are encoded with a length-prefixed
    /// scheme so that concatenation is unambiguous, but comparisons
    /// remain purely byte-lexicographic on the resulting buffer.
    pub fn append_segment(&mut self, segment: &[u8]) {
        match self {
            Key::Real(b) => {
                b.extend_from_slice(&(segment.len() as u32).to_be_bytes());
                b.extend_from_slice(segment);
            }
            Key::Before | Key::After => panic!("cannot append a segment to a sentinel key"),
        }
    }

    /// Maximum storable key size for a page of the given size:
    /// `floor((pageSize - fixedOverhead) / 4)`.
    pub fn max_size(page_size: usize, fixed_overhead: usize) -> usize {
        page_size.saturating_sub(fixed_overhead) / 4
    }

    /// Number of leading bytes shared with `other` (used by page
    /// layout's prefix compression).
    pub fn shared_prefix_len(&self, other: &Key) -> usize {
        let a = self.bytes();
        let b = other.bytes();
        a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
    }

    /// The first segment of a multi-segment key, used to decide
    /// shallow-traversal grouping. Segments are framed
    /// with a 4-byte big-endian length prefix by `append_segment`.
    pub fn first_segment(&self) -> &[u8] {
        let bytes = self.bytes();
        if bytes.len() < 4 {
            return bytes;
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let end = (4 + len).min(bytes.len());
        &bytes[4..end]
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Before, Key::Before) => Ordering::Equal,
            (Key::Before, _) => Ordering::Less,
            (_, Key::Before) => Ordering::Greater,
            (Key::After, Key::After) => Ordering::Equal,
            (Key::After, _) => Ordering::Greater,
            (_, Key::After) => Ordering::Less,
            (Key::Real(a), Key::Real(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Before => write!(f, "Key::BEFORE"),
            Key::After => write!(f, "Key::AFTER"),
            Key::Real(b) => write!(f, "Key({})", hex::encode(b)),
        }
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key::Real(b.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key::Real(b)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Real(s.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_bound_real_keys() {
        let k = Key::from("hello");
        assert!(Key::Before < k);
        assert!(k < Key::After);
        assert!(Key::Before < Key::After);
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Key::from("a") < Key::from("b"));
        assert!(Key::from("ab") < Key::from("b"));
        assert!(Key::from("a") < Key::from("aa"));
    }

    #[test]
    fn shared_prefix_len_counts_common_bytes() {
        let a = Key::from("abcdef");
        let b = Key::from("abcxyz");
        assert_eq!(a.shared_prefix_len(&b), 3);
    }

    #[test]
    fn segments_round_trip_through_first_segment() {
        let mut k = Key::empty();
        k.append_segment(b"tenant-1");
        k.append_segment(b"order-42");
        assert_eq!(k.first_segment(), b"tenant-1");
    }
}
