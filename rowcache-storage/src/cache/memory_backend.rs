//! Process-local cache backend.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use rowcache_core::BackendError;

use super::traits::{CacheBackend, CacheStats};
use crate::lock::{rw_read, rw_write};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `HashMap`-backed cache with per-entry expiry.
///
/// Expired entries are dropped when next read or overwritten.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<String, Entry>>,
    stats: RwLock<CacheStats>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every entry. Hit/miss counters are kept.
    pub fn clear(&self) {
        rw_write(&self.entries, "memory.clear").clear();
        let mut stats = rw_write(&self.stats, "memory.clear");
        stats.entry_count = 0;
        stats.memory_bytes = 0;
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, "memory.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        rw_read(&self.entries, "memory.contains_key")
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Every live key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = rw_read(&self.entries, "memory.keys")
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn removed(&self, entry: &Entry, expired: bool) {
        let mut stats = rw_write(&self.stats, "memory.removed");
        stats.entry_count = stats.entry_count.saturating_sub(1);
        stats.memory_bytes = stats.memory_bytes.saturating_sub(entry.value.len() as u64);
        if expired {
            stats.expirations += 1;
        }
    }
}

impl CacheBackend for InMemoryCacheBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let now = Instant::now();
        let found = rw_read(&self.entries, "memory.get").get(key).cloned();

        let value = match found {
            Some(entry) if entry.is_expired(now) => {
                let mut entries = rw_write(&self.entries, "memory.get");
                // Re-check under the write lock; a concurrent set may have replaced it.
                if entries.get(key).is_some_and(|e| e.is_expired(now)) {
                    if let Some(expired) = entries.remove(key) {
                        drop(entries);
                        self.removed(&expired, true);
                    }
                }
                None
            }
            Some(entry) => Some(entry.value),
            None => None,
        };

        let mut stats = rw_write(&self.stats, "memory.get");
        if value.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackendError> {
        let entry = Entry {
            value: value.to_string(),
            // A TTL past the representable range never expires.
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        let size = entry.value.len() as u64;
        let previous = rw_write(&self.entries, "memory.set").insert(key.to_string(), entry);

        let mut stats = rw_write(&self.stats, "memory.set");
        match previous {
            Some(old) => {
                stats.memory_bytes = stats.memory_bytes.saturating_sub(old.value.len() as u64);
            }
            None => stats.entry_count += 1,
        }
        stats.memory_bytes += size;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        let removed = rw_write(&self.entries, "memory.delete").remove(key);
        if let Some(entry) = removed {
            self.removed(&entry, false);
        }
        Ok(())
    }

    fn stats(&self) -> Result<CacheStats, BackendError> {
        Ok(rw_read(&self.stats, "memory.stats").clone())
    }
}
