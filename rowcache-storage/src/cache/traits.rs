//! Cache backend trait, statistics and the named backend registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rowcache_core::{BackendError, CacheResult, ConfigError};

/// Key-value cache backend.
///
/// Values are opaque strings. Implementations must be thread-safe; only
/// single-key atomicity is assumed.
pub trait CacheBackend: Send + Sync {
    /// Get the value stored under `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// `ttl` of `None` stores the entry without expiry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackendError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Get cache statistics.
    fn stats(&self) -> Result<CacheStats, BackendError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate size of stored values in bytes.
    pub memory_bytes: u64,
    /// Number of entries dropped because they expired.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Named cache backends, resolved by controllers at registration.
#[derive(Clone, Default)]
pub struct Backends {
    backends: HashMap<String, Arc<dyn CacheBackend>>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.backends.keys().collect();
        names.sort();
        f.debug_struct("Backends").field("names", &names).finish()
    }
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a single backend under `name`.
    pub fn single(name: impl Into<String>, backend: Arc<dyn CacheBackend>) -> Self {
        Self::new().with(name, backend)
    }

    pub fn with(mut self, name: impl Into<String>, backend: Arc<dyn CacheBackend>) -> Self {
        self.insert(name, backend);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, backend: Arc<dyn CacheBackend>) {
        self.backends.insert(name.into(), backend);
    }

    /// Resolve `name`, failing with `ConfigError::UnknownBackend`.
    pub fn resolve(&self, name: &str) -> CacheResult<Arc<dyn CacheBackend>> {
        self.backends.get(name).cloned().ok_or_else(|| {
            ConfigError::UnknownBackend {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheBackend;
    use rowcache_core::CacheError;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_backends_resolve() {
        let backends = Backends::single("default", Arc::new(InMemoryCacheBackend::new()));
        assert!(backends.resolve("default").is_ok());
        assert_eq!(backends.len(), 1);

        let err = backends.resolve("sessions").err().unwrap();
        assert!(matches!(
            err,
            CacheError::Config(ConfigError::UnknownBackend { .. })
        ));
    }
}
