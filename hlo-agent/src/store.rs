//! Storage seam between the coordination agent and the cache engine.
//!
//! The agent never owns eviction or persistence; it needs just enough of
//! a store to honor range transfers and serve gated reads and writes.
//! Range membership is decided by hashing the key onto the circle, the
//! same projection the ring uses for ownership.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use hlo_core::{KeyRange, Position};

/// Minimal store interface the agent drives during rebalancing.
pub trait RangeStore: Send + Sync {
    /// Insert or replace one entry; returns the previous value if any.
    fn insert(&self, key: String, value: String) -> Option<String>;

    fn get(&self, key: &str) -> Option<String>;

    fn remove(&self, key: &str) -> Option<String>;

    /// Bulk-load entries received in a transfer, replacing duplicates.
    fn insert_many(&self, pairs: Vec<(String, String)>);

    /// Copy out every entry whose key position falls inside `range`.
    fn copy_range(&self, range: &KeyRange) -> Vec<(String, String)>;

    /// Drop every entry whose key position falls inside `range`;
    /// returns how many were dropped.
    fn remove_range(&self, range: &KeyRange) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded in-memory store.
///
/// Stands in for the real cache engine behind the same trait; capacity
/// and eviction policy are provisioning inputs for that engine, not
/// enforced here.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RangeStore for MemoryStore {
    fn insert(&self, key: String, value: String) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remove(&self, key: &str) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    fn insert_many(&self, pairs: Vec<(String, String)>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in pairs {
            entries.insert(key, value);
        }
    }

    fn copy_range(&self, range: &KeyRange) -> Vec<(String, String)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| range.contains(Position::of(key.as_bytes())))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn remove_range(&self, range: &KeyRange) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !range.contains(Position::of(key.as_bytes())));
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// A range containing exactly the position of `key`.
    fn point_range(key: &str) -> KeyRange {
        let p = Position::of(key.as_bytes());
        KeyRange::new(p, p)
    }

    /// The circle minus the position of `key`.
    fn complement_range(key: &str) -> KeyRange {
        let p = Position::of(key.as_bytes());
        KeyRange::new(p.wrapping_next(), p.wrapping_prev())
    }

    #[test]
    fn test_insert_get_remove() {
        let store = MemoryStore::new();
        assert!(store.insert("alpha".into(), "1".into()).is_none());
        assert_eq!(store.insert("alpha".into(), "2".into()).as_deref(), Some("1"));
        assert_eq!(store.get("alpha").as_deref(), Some("2"));
        assert_eq!(store.remove("alpha").as_deref(), Some("2"));
        assert!(store.get("alpha").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_copy_range_selects_by_position() {
        let store = MemoryStore::new();
        store.insert("keep".into(), "k".into());
        store.insert("move".into(), "m".into());

        let copied = store.copy_range(&point_range("move"));
        assert_eq!(copied, vec![("move".to_string(), "m".to_string())]);

        // Copy leaves the source untouched.
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_range_drops_only_members() {
        let store = MemoryStore::new();
        store.insert("keep".into(), "k".into());
        store.insert("drop".into(), "d".into());

        let removed = store.remove_range(&complement_range("keep"));
        assert_eq!(removed, 1);
        assert_eq!(store.get("keep").as_deref(), Some("k"));
        assert!(store.get("drop").is_none());
    }

    #[test]
    fn test_insert_many_replaces_duplicates() {
        let store = MemoryStore::new();
        store.insert("a".into(), "old".into());
        store.insert_many(vec![
            ("a".into(), "new".into()),
            ("b".into(), "2".into()),
        ]);
        assert_eq!(store.get("a").as_deref(), Some("new"));
        assert_eq!(store.get("b").as_deref(), Some("2"));
        assert_eq!(store.len(), 2);
    }
}
