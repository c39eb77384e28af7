//! In-memory key-value state.
//!
//! The publisher holds the authoritative `StateStore`; every subscriber
//! holds an independent replica of the same type. Deletion is not modelled:
//! a key, once written, stays until the process exits.

use std::collections::HashMap;

use crate::entry::KvEntry;

/// Latest accepted entry per key. Iteration order is unspecified.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateStore {
    entries: HashMap<String, KvEntry>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the slot for `entry.key`.
    ///
    /// Entries with an empty key or an empty body are never stored; returns
    /// whether the entry was kept.
    pub fn put(&mut self, entry: KvEntry) -> bool {
        if !entry.is_storable() {
            return false;
        }
        self.entries.insert(entry.key.clone(), entry);
        true
    }

    pub fn get(&self, key: &str) -> Option<&KvEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lazily enumerates the current entries in no particular order.
    ///
    /// Each call starts over from the store's state at that moment; the
    /// borrow keeps writers out for as long as the iterator lives.
    pub fn snapshot(&self) -> impl Iterator<Item = &KvEntry> + '_ {
        self.entries.values()
    }
}
