//! LMDB-backed cache backend.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a persistent,
//! memory-mapped key-value store shared by every process that opens the same
//! directory.
//!
//! # Value Format
//!
//! Each value is stored as `[expires_at: 8 bytes][utf-8 payload]`, where
//! `expires_at` is a little-endian Unix timestamp in milliseconds and `0`
//! means no expiry. Expired entries read as absent and are removed on that
//! read; [`LmdbCacheBackend::purge_expired`] sweeps the rest.

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use rowcache_core::BackendError;
use tracing::debug;

use super::traits::{CacheBackend, CacheStats};
use crate::lock::{rw_read, rw_write};

const HEADER_LEN: usize = 8;
const NO_EXPIRY: i64 = 0;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored value is not in the expected format.
    #[error("Corrupt cache value: {0}")]
    Corrupt(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for BackendError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Transaction(reason) => BackendError::Transaction { reason },
            LmdbCacheError::Corrupt(reason) => BackendError::Serialization { reason },
            other => BackendError::Unavailable {
                operation: "open".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

fn txn_error(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

fn encode_value(value: &str, ttl: Option<Duration>) -> Vec<u8> {
    let expires_at = match ttl {
        Some(ttl) => {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            Utc::now().timestamp_millis().saturating_add(millis).max(1)
        }
        None => NO_EXPIRY,
    };
    let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
    bytes.extend_from_slice(&expires_at.to_le_bytes());
    bytes.extend_from_slice(value.as_bytes());
    bytes
}

/// Split a stored value into its expiry and payload.
fn decode_value(bytes: &[u8]) -> Result<(i64, &str), LmdbCacheError> {
    if bytes.len() < HEADER_LEN {
        return Err(LmdbCacheError::Corrupt("value shorter than header".into()));
    }
    let (header, body) = bytes.split_at(HEADER_LEN);
    let header: [u8; HEADER_LEN] = header
        .try_into()
        .map_err(|_| LmdbCacheError::Corrupt("invalid expiry header".into()))?;
    let payload =
        std::str::from_utf8(body).map_err(|e| LmdbCacheError::Corrupt(e.to_string()))?;
    Ok((i64::from_le_bytes(header), payload))
}

fn is_expired(expires_at: i64, now_millis: i64) -> bool {
    expires_at != NO_EXPIRY && expires_at <= now_millis
}

/// Persistent cache backend on a single unnamed LMDB database.
///
/// # Example
///
/// ```ignore
/// use rowcache_storage::{Backends, LmdbCacheBackend};
/// use std::sync::Arc;
///
/// let backend = LmdbCacheBackend::new("/var/cache/rowcache", 1024)?;
/// let backends = Backends::single("default", Arc::new(backend));
/// ```
pub struct LmdbCacheBackend {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Hit/miss/expiry counters. Entry count is read from LMDB.
    stats: RwLock<CacheStats>,
}

impl std::fmt::Debug for LmdbCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbCacheBackend")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbCacheBackend {
    /// Create a new LMDB cache backend.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        let map_size = max_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            LmdbCacheError::EnvOpen(format!("map size of {max_size_mb} MB overflows"))
        })?;
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per backend and never
        // re-opened in this process while alive.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        Ok(Self {
            env,
            db,
            stats: RwLock::new(CacheStats::default()),
        })
    }

    /// Create a backend from `CacheSettings`, if an LMDB path is configured.
    pub fn from_settings(
        settings: &rowcache_core::CacheSettings,
    ) -> Option<Result<Self, LmdbCacheError>> {
        settings
            .lmdb_path
            .as_ref()
            .map(|path| Self::new(path, settings.lmdb_max_size_mb))
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<u64, LmdbCacheError> {
        let now = Utc::now().timestamp_millis();
        let expired: Vec<Vec<u8>> = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            let mut keys = Vec::new();
            for result in self.db.iter(&rtxn).map_err(txn_error)? {
                let (key, value) = result.map_err(txn_error)?;
                match decode_value(value) {
                    Ok((expires_at, _)) if is_expired(expires_at, now) => keys.push(key.to_vec()),
                    Ok(_) => {}
                    // unreadable values can never be served; drop them too
                    Err(_) => keys.push(key.to_vec()),
                }
            }
            keys
        };

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut removed = 0u64;
        for key in &expired {
            if self.db.delete(&mut wtxn, key).map_err(txn_error)? {
                removed += 1;
            }
        }
        wtxn.commit().map_err(txn_error)?;

        rw_write(&self.stats, "lmdb.purge").expirations += removed;
        debug!(removed, "purged expired cache entries");
        Ok(removed)
    }

    fn record(&self, hit: bool) {
        let mut stats = rw_write(&self.stats, "lmdb.record");
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
    }

    // Delete `key` only if it still holds an expired value.
    fn expire(&self, key: &str) -> Result<(), LmdbCacheError> {
        let now = Utc::now().timestamp_millis();
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let still_expired = match self.db.get(&wtxn, key.as_bytes()).map_err(txn_error)? {
            Some(bytes) => decode_value(bytes).map_or(true, |(at, _)| is_expired(at, now)),
            None => false,
        };
        if still_expired {
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;

        if still_expired {
            rw_write(&self.stats, "lmdb.expire").expirations += 1;
        }
        Ok(())
    }
}

impl CacheBackend for LmdbCacheBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let now = Utc::now().timestamp_millis();
        let found = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            match self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)? {
                Some(bytes) => {
                    let (expires_at, payload) = decode_value(bytes)?;
                    if is_expired(expires_at, now) {
                        Err(())
                    } else {
                        Ok(Some(payload.to_string()))
                    }
                }
                None => Ok(None),
            }
        };

        match found {
            Ok(value) => {
                self.record(value.is_some());
                Ok(value)
            }
            Err(()) => {
                self.record(false);
                self.expire(key)?;
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackendError> {
        let bytes = encode_value(value, ttl);
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    fn stats(&self) -> Result<CacheStats, BackendError> {
        let entry_count = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            self.db.len(&rtxn).map_err(txn_error)?
        };
        let mut stats = rw_read(&self.stats, "lmdb.stats").clone();
        stats.entry_count = entry_count;
        // LMDB doesn't expose live value sizes cheaply
        stats.memory_bytes = 0;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_backend() -> (LmdbCacheBackend, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let backend =
            LmdbCacheBackend::new(temp_dir.path(), 10).expect("backend creation should succeed");
        (backend, temp_dir)
    }

    #[test]
    fn test_new_backend() {
        let (backend, _dir) = create_test_backend();
        let stats = backend.stats().unwrap();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_set_and_get() {
        let (backend, _dir) = create_test_backend();
        backend.set("shop.Brand.abc", r#"{"id":1}"#, None).unwrap();
        assert_eq!(
            backend.get("shop.Brand.abc").unwrap(),
            Some(r#"{"id":1}"#.to_string())
        );
    }

    #[test]
    fn test_oversized_map_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = LmdbCacheBackend::new(temp_dir.path(), usize::MAX);
        assert!(matches!(result, Err(LmdbCacheError::EnvOpen(_))));
    }

    #[test]
    fn test_get_nonexistent() {
        let (backend, _dir) = create_test_backend();
        assert_eq!(backend.get("missing").unwrap(), None);
        assert_eq!(backend.stats().unwrap().misses, 1);
    }

    #[test]
    fn test_delete() {
        let (backend, _dir) = create_test_backend();
        backend.set("k", "v", None).unwrap();
        backend.delete("k").unwrap();
        assert_eq!(backend.get("k").unwrap(), None);
        backend.delete("k").unwrap();
    }

    #[test]
    fn test_overwrite() {
        let (backend, _dir) = create_test_backend();
        backend.set("k", "v1", None).unwrap();
        backend.set("k", "v2", None).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some("v2".to_string()));
        assert_eq!(backend.stats().unwrap().entry_count, 1);
    }

    #[test]
    fn test_expired_entry_is_absent_and_purged_on_read() {
        let (backend, _dir) = create_test_backend();
        // a TTL in the past, written directly
        let past = (Utc::now().timestamp_millis() - 1_000).to_le_bytes();
        let mut bytes = past.to_vec();
        bytes.extend_from_slice(b"stale");
        {
            let mut wtxn = backend.env.write_txn().unwrap();
            backend.db.put(&mut wtxn, b"k", &bytes).unwrap();
            wtxn.commit().unwrap();
        }

        assert_eq!(backend.get("k").unwrap(), None);
        let stats = backend.stats().unwrap();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_future_ttl_is_served() {
        let (backend, _dir) = create_test_backend();
        backend
            .set("k", "v", Some(Duration::from_secs(3600)))
            .unwrap();
        assert_eq!(backend.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_purge_expired() {
        let (backend, _dir) = create_test_backend();
        backend.set("keep", "v", None).unwrap();
        backend.set("gone", "v", Some(Duration::ZERO)).unwrap();
        assert_eq!(backend.purge_expired().unwrap(), 1);
        assert_eq!(backend.stats().unwrap().entry_count, 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let backend = LmdbCacheBackend::new(temp_dir.path(), 10).unwrap();
            backend.set("k", "v", None).unwrap();
        }
        let backend = LmdbCacheBackend::new(temp_dir.path(), 10).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_short_value_is_corrupt() {
        assert!(matches!(
            decode_value(&[1, 2, 3]),
            Err(LmdbCacheError::Corrupt(_))
        ));
    }

    #[test]
    fn test_error_conversion() {
        let err: BackendError = LmdbCacheError::Transaction("map full".into()).into();
        assert!(matches!(err, BackendError::Transaction { .. }));
    }
}
