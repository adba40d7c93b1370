use std::collections::HashMap;
use std::sync::Mutex;

use super::types::{DismissalChange, MemberProfile};

/// Process-lifetime key-value store shared by concurrently fanned-out
/// per-member operations. Entries live until explicitly removed or the
/// process exits; there is no TTL. Keys are member ids, so concurrent
/// writers never contend on the same entry.
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.lock().unwrap().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.lock().unwrap().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Member profiles fetched once per process.
pub type ProfileCache = MemoryCache<MemberProfile>;

/// Dismissal-change records stashed before Absent writes, evicted on restore.
pub type ChangeCache = MemoryCache<DismissalChange>;
