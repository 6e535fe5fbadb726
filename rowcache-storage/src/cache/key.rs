//! Cache key derivation.
//!
//! Keys are pure functions of the entity identity and the lookup filters;
//! they never consult the store or the backend.
//!
//! # Format
//!
//! - Entity keys: `{app_label}.{Entity}.{digest}` where `digest` is the
//!   hex-encoded first 16 bytes of a SHA-256 over the filter pairs, sorted
//!   by field name, with each field and stringified value length-prefixed.
//! - Multi-row keys: `{app_label}.{Entity}.objects.{name}`.
//!
//! Values are stringified before hashing, so `Int(1)` and `Text("1")` land
//! on the same key.

use rowcache_core::{EntitySchema, Filters};
use sha2::{Digest, Sha256};

/// Bytes of the SHA-256 output kept in the key.
const DIGEST_BYTES: usize = 16;

/// Derive the cache key addressing one entity by `filters`.
///
/// The raw primary-key field name is folded into the `pk` alias first, and
/// argument order does not matter.
pub fn derive_entity_key(schema: &EntitySchema, filters: &Filters) -> String {
    let filters = filters.with_pk_alias(schema);
    let mut pairs: Vec<(&str, String)> = filters
        .iter()
        .map(|f| (f.field.as_str(), f.value.key_text()))
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    for (field, value) in &pairs {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();

    format!(
        "{}.{}.{}",
        schema.app_label(),
        schema.name(),
        hex::encode(&digest[..DIGEST_BYTES])
    )
}

/// Derive the key of a named multi-row result entry.
pub fn derive_multi_row_key(schema: &EntitySchema, name: &str) -> String {
    format!("{}.{}.objects.{}", schema.app_label(), schema.name(), name)
}
