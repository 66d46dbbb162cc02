//! Fast Index: an auxiliary per-page search accelerator that caches
//! full keys so binary search does not have to re-walk elided prefixes.
//! Validity is a property, never a persisted field — it is rebuilt
//! from the key blocks whenever it is invalidated and next needed.

/// Cached full keys for each entry, used to skip re-walking elided
/// prefixes during binary search. `None` means "not built yet / stale".
#[derive(Default, Debug, Clone)]
pub struct FastIndex {
    cache: Option<Vec<Vec<u8>>>,
}

impl FastIndex {
    pub fn new() -> Self {
        FastIndex { cache: None }
    }

    pub fn is_valid(&self) -> bool {
        self.cache.is_some()
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Rebuilds the cache from the full decoded keys of every entry,
    /// in page order. Cheap relative to re-deriving them on every
    /// `findKey` call during a hot binary search.
    pub fn rebuild(&mut self, full_keys: Vec<Vec<u8>>) {
        self.cache = Some(full_keys);
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.cache.as_ref().and_then(|c| c.get(index)).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_invalid() {
        let idx = FastIndex::new();
        assert!(!idx.is_valid());
    }

    #[test]
    fn rebuild_then_invalidate() {
        let mut idx = FastIndex::new();
        idx.rebuild(vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(idx.is_valid());
        assert_eq!(idx.get(0), Some(&b"a"[..]));
        idx.invalidate();
        assert!(!idx.is_valid());
        assert_eq!(idx.get(0), None);
    }
}
