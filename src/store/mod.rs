pub mod entry;

use entry::CacheEntry;
use std::collections::HashMap;

/// The key-value map owned by the engine.
///
/// Every removal or replacement cancels the displaced entry's timer before the
/// entry is dropped, so a stale timer never outlives the value it was armed for.
#[derive(Debug, Default)]
pub struct CacheMap {
    data: HashMap<String, CacheEntry>,
    /// Monotonically increasing generation counter, one tick per install.
    generation_seq: u64,
}

impl CacheMap {
    pub fn new() -> Self {
        CacheMap::default()
    }

    /// Reserve the generation for the next install.
    pub fn next_generation(&mut self) -> u64 {
        self.generation_seq += 1;
        self.generation_seq
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.data.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Stop any timer on `key` without touching its value.
    pub fn cancel_timer(&mut self, key: &str) {
        if let Some(entry) = self.data.get_mut(key) {
            entry.cancel_timer();
        }
    }

    /// Install an entry, replacing whatever was there.
    pub fn insert(&mut self, key: String, entry: CacheEntry) {
        if let Some(mut old) = self.data.insert(key, entry) {
            old.cancel_timer();
        }
    }

    /// Delete a key. Returns true if it existed.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.data.remove(key) {
            Some(mut entry) => {
                entry.cancel_timer();
                true
            }
            None => false,
        }
    }

    /// Delete a key only if it still holds the given generation.
    pub fn remove_generation(&mut self, key: &str, generation: u64) -> bool {
        if self.data.get(key).is_some_and(|e| e.generation == generation) {
            self.remove(key)
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of entries with a pending expiration.
    pub fn expires_count(&self) -> usize {
        self.data.values().filter(|e| e.has_timer()).count()
    }
}
