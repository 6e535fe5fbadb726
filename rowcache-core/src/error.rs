//! Error types for rowcache operations

use thiserror::Error;

/// Store layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} matching {filters} does not exist")]
    NotFound { entity: String, filters: String },

    #[error("{entity} matching {filters} returned {count} rows, expected one")]
    MultipleFound {
        entity: String,
        filters: String,
        count: usize,
    },

    #[error("Write failed for {entity}: {reason}")]
    WriteFailed { entity: String, reason: String },
}

/// Payload encoding/decoding errors.
///
/// These never reach callers of the cache controller: every variant is
/// handled as a cache miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Cached payload for {entity} is incompatible with the current schema: {reason}")]
    Incompatible { entity: String, reason: String },

    #[error("Cached payload for {entity} is malformed: {reason}")]
    Malformed { entity: String, reason: String },

    #[error("Value of {entity}.{field} cannot be encoded: {reason}")]
    Unencodable {
        entity: String,
        field: String,
        reason: String,
    },
}

/// Cache backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Cache backend unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Cache backend transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Cache backend serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown field {field} on {entity}")]
    UnknownField { entity: String, field: String },

    #[error("Unknown relation {relation} on {entity}")]
    UnknownRelation { entity: String, relation: String },

    #[error("No cache backend registered as {name}")]
    UnknownBackend { name: String },
}

/// Master error type for all rowcache errors.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Returns true if this is a store-level `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }
}

/// Result type alias for rowcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
