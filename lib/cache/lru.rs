//! Bounded LRU index over byte-weighted records.
//!
//! The index is a plain data structure: it owns no locks and performs no I/O.
//! Callers (the cache coordinator, the metadata caches) wrap it in whatever
//! synchronisation their access pattern needs and run cleanup on the records
//! `insert` evicts.

use hashlink::LinkedHashMap;
use thiserror::Error;
use tracing::trace;

/// Records stored in an [`LruIndex`] expose their byte cost.
pub trait Weighted {
    /// The number of budget bytes this record accounts for.
    fn size(&self) -> u64;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LruError {
    /// The record alone exceeds the whole cache budget.
    #[error("entry of {entry_bytes} bytes exceeds the cache budget of {max_bytes} bytes")]
    InvalidEntrySize { entry_bytes: u64, max_bytes: u64 },
}

/// A bounded associative container with LRU replacement.
///
/// Keys are rendered cache-key strings. Recency order lives in the linked
/// hash map (front = least recently used, back = most recently used); byte
/// accounting is maintained so that `current_bytes <= max_bytes` holds at
/// every public-method boundary.
#[derive(Debug)]
pub struct LruIndex<V> {
    entries: LinkedHashMap<String, V>,
    max_bytes: u64,
    current_bytes: u64,
}

impl<V: Weighted + Clone> LruIndex<V> {
    /// Create an index with the given byte budget.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: LinkedHashMap::new(),
            max_bytes,
            current_bytes: 0,
        }
    }

    /// Insert or replace the record under `key` and promote it to most
    /// recently used, then evict least-recently-used records until the index
    /// is back under budget. Evicted records are returned oldest-first; the
    /// caller owns their cleanup.
    ///
    /// A record larger than the whole budget is rejected before any mutation.
    pub fn insert(&mut self, key: String, value: V) -> Result<Vec<V>, LruError> {
        let incoming = value.size();
        if incoming > self.max_bytes {
            return Err(LruError::InvalidEntrySize {
                entry_bytes: incoming,
                max_bytes: self.max_bytes,
            });
        }

        if let Some(previous) = self.entries.remove(&key) {
            self.current_bytes -= previous.size();
        }
        self.current_bytes += incoming;
        self.entries.insert(key, value);

        let mut evicted = Vec::new();
        while self.current_bytes > self.max_bytes {
            let Some((key, value)) = self.entries.pop_front() else {
                break;
            };
            self.current_bytes -= value.size();
            trace!(key = %key, bytes = value.size(), "evicting least recently used entry");
            evicted.push(value);
        }
        Ok(evicted)
    }

    /// Look up `key` and promote it to most recently used.
    pub fn lookup(&mut self, key: &str) -> Option<V> {
        // remove + insert refreshes the entry's position in the linked list.
        let value = self.entries.remove(key)?;
        let out = value.clone();
        self.entries.insert(key.to_owned(), value);
        Some(out)
    }

    /// Look up `key` without touching recency.
    pub fn lookup_peek(&self, key: &str) -> Option<V> {
        self.entries.get(key).cloned()
    }

    /// Replace the record under `key` without touching recency. The
    /// replacement must have the same byte cost; returns whether the record
    /// was updated.
    pub fn update_in_place(&mut self, key: &str, value: V) -> bool {
        match self.entries.get_mut(key) {
            Some(slot) if slot.size() == value.size() => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    /// Remove and return the record under `key`.
    pub fn erase(&mut self, key: &str) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.current_bytes -= value.size();
        Some(value)
    }

    /// Remove and return every record whose key starts with `prefix`.
    /// Return order is unspecified.
    pub fn erase_prefix(&mut self, prefix: &str) -> Vec<V> {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.erase(key)).collect()
    }

    /// Remove every record. Returned records are the caller's to clean up.
    pub fn clear(&mut self) -> Vec<V> {
        self.current_bytes = 0;
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some((_, value)) = self.entries.pop_front() {
            drained.push(value);
        }
        drained
    }

    /// Total bytes currently accounted for.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    /// The configured byte budget.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Number of records in the index.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestRecord {
        tag: &'static str,
        bytes: u64,
    }

    impl Weighted for TestRecord {
        fn size(&self) -> u64 {
            self.bytes
        }
    }

    fn record(tag: &'static str, bytes: u64) -> TestRecord {
        TestRecord { tag, bytes }
    }

    #[test]
    fn insert_then_lookup_returns_value() {
        let mut index = LruIndex::new(1024);
        index.insert("k".to_owned(), record("v", 10)).expect("insert");
        assert_eq!(index.lookup("k"), Some(record("v", 10)));
    }

    #[test]
    fn evicts_least_recently_used_first() {
        // Budget 1024: 600 + 400 fit, adding 100 pushes the oldest out.
        let mut index = LruIndex::new(1024);
        assert!(index.insert("k1".to_owned(), record("a", 600)).expect("k1").is_empty());
        assert!(index.insert("k2".to_owned(), record("b", 400)).expect("k2").is_empty());

        let evicted = index.insert("k3".to_owned(), record("c", 100)).expect("k3");
        assert_eq!(evicted, vec![record("a", 600)], "k1 is the LRU entry");
        assert_eq!(index.lookup_peek("k1"), None);
        assert_eq!(index.current_bytes(), 500);
    }

    #[test]
    fn single_insert_may_evict_multiple_entries() {
        let mut index = LruIndex::new(1024);
        for (key, tag) in [("a", "a"), ("b", "b"), ("c", "c"), ("d", "d")] {
            assert!(index.insert(key.to_owned(), record(tag, 200)).expect("warm").is_empty());
        }

        let evicted = index.insert("e".to_owned(), record("e", 600)).expect("e");
        assert_eq!(
            evicted,
            vec![record("a", 200), record("b", 200)],
            "evictions come back oldest-first"
        );
        assert_eq!(index.current_bytes(), 1000);
        assert_eq!(index.entry_count(), 3);
    }

    #[test]
    fn lookup_promotes_entry() {
        let mut index = LruIndex::new(400);
        index.insert("a".to_owned(), record("a", 200)).expect("a");
        index.insert("b".to_owned(), record("b", 200)).expect("b");

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(index.lookup("a").is_some());

        let evicted = index.insert("c".to_owned(), record("c", 200)).expect("c");
        assert_eq!(evicted, vec![record("b", 200)]);
        assert!(index.lookup_peek("a").is_some());
    }

    #[test]
    fn lookup_peek_does_not_promote() {
        let mut index = LruIndex::new(400);
        index.insert("a".to_owned(), record("a", 200)).expect("a");
        index.insert("b".to_owned(), record("b", 200)).expect("b");

        assert!(index.lookup_peek("a").is_some());

        let evicted = index.insert("c".to_owned(), record("c", 200)).expect("c");
        assert_eq!(evicted, vec![record("a", 200)], "peek must not refresh recency");
    }

    #[test]
    fn reinsert_replaces_value_and_adjusts_bytes() {
        let mut index = LruIndex::new(1024);
        index.insert("k".to_owned(), record("v1", 300)).expect("v1");
        index.insert("k".to_owned(), record("v2", 500)).expect("v2");

        assert_eq!(index.entry_count(), 1);
        assert_eq!(index.current_bytes(), 500);
        assert_eq!(index.lookup_peek("k"), Some(record("v2", 500)));
    }

    #[test]
    fn oversized_entry_is_rejected_without_mutation() {
        let mut index = LruIndex::new(100);
        index.insert("small".to_owned(), record("s", 40)).expect("small");

        let err = index.insert("big".to_owned(), record("b", 101)).expect_err("too big");
        assert_eq!(
            err,
            LruError::InvalidEntrySize {
                entry_bytes: 101,
                max_bytes: 100
            }
        );
        assert_eq!(index.current_bytes(), 40, "failed insert must not mutate");
        assert!(index.lookup_peek("big").is_none());
        assert!(index.lookup_peek("small").is_some());
    }

    #[test]
    fn unbounded_index_never_evicts() {
        let mut index = LruIndex::new(u64::MAX);
        for i in 0..64u64 {
            let evicted = index
                .insert(format!("k{i}"), record("v", u64::MAX / 128))
                .expect("insert");
            assert!(evicted.is_empty());
        }
        assert_eq!(index.entry_count(), 64);
    }

    #[test]
    fn update_in_place_keeps_recency_and_requires_same_size() {
        let mut index = LruIndex::new(400);
        index.insert("a".to_owned(), record("a", 200)).expect("a");
        index.insert("b".to_owned(), record("b", 200)).expect("b");

        assert!(index.update_in_place("a", record("a2", 200)));
        assert!(!index.update_in_place("a", record("a3", 100)), "size must match");
        assert!(!index.update_in_place("missing", record("x", 10)));

        // "a" was updated but not promoted, so it is still the LRU entry.
        let evicted = index.insert("c".to_owned(), record("c", 200)).expect("c");
        assert_eq!(evicted, vec![record("a2", 200)]);
    }

    #[test]
    fn erase_removes_entry() {
        let mut index = LruIndex::new(1024);
        index.insert("k".to_owned(), record("v", 100)).expect("insert");

        assert_eq!(index.erase("k"), Some(record("v", 100)));
        assert_eq!(index.lookup_peek("k"), None);
        assert_eq!(index.current_bytes(), 0);
        assert_eq!(index.erase("k"), None, "second erase is a no-op");
    }

    #[test]
    fn erase_prefix_removes_exactly_matching_keys() {
        let mut index = LruIndex::new(u64::MAX);
        index.insert("buk1ts/a/f1".to_owned(), record("f1", 10)).expect("f1");
        index.insert("buk1ts/a/f2".to_owned(), record("f2", 10)).expect("f2");
        index.insert("buk1ts/b/f3".to_owned(), record("f3", 10)).expect("f3");

        let erased = index.erase_prefix("buk1ts/a/");
        assert_eq!(erased.len(), 2);
        assert!(index.lookup_peek("buk1ts/a/f1").is_none());
        assert!(index.lookup_peek("buk1ts/a/f2").is_none());
        assert!(index.lookup_peek("buk1ts/b/f3").is_some());
        assert_eq!(index.current_bytes(), 10);
    }

    #[test]
    fn clear_drains_everything() {
        let mut index = LruIndex::new(1024);
        index.insert("a".to_owned(), record("a", 100)).expect("a");
        index.insert("b".to_owned(), record("b", 100)).expect("b");

        let drained = index.clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(index.entry_count(), 0);
        assert_eq!(index.current_bytes(), 0);
    }
}
