//! Field-keyed entity cache.
//!
//! A [`CacheController`] sits in front of one entity's [`Store`](crate::Store)
//! and caches its rows in a pluggable [`CacheBackend`], addressable by the
//! primary key and by any declared unique field or field combination.
//!
//! # Consistency
//!
//! The controller subscribes to its store's writes. After every save the
//! row's payload is written under each key the row answers to; after every
//! delete those keys are removed. Named multi-row results store primary
//! keys only and rebuild themselves when a referenced row has gone missing.
//!
//! Payloads are decoded against the current schema, so entries written by an
//! older schema are either still valid (extra fields are ignored) or read as
//! a miss. Backend failures are logged and also read as a miss; they never
//! replace a store error.
//!
//! # Example
//!
//! ```ignore
//! let backends = Backends::single("default", Arc::new(InMemoryCacheBackend::new()));
//! let registry = EntityRegistry::new();
//! let products = CacheController::register(
//!     store.table(product_schema),
//!     &backends,
//!     &registry,
//!     CacheOptions::default().key("code").key(["brand_id", "name"]),
//! )?;
//!
//! let phone = products.get(&Filters::new().eq("code", code))?;
//! ```

pub mod controller;
pub mod key;
pub mod lmdb_backend;
pub mod memory_backend;
pub mod multiple;
pub mod payload;
pub mod related;
pub mod traits;

pub use controller::{CacheController, GetOptions};
pub use key::{derive_entity_key, derive_multi_row_key};
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory_backend::InMemoryCacheBackend;
pub use related::{EntityRegistry, RelatedResolver};
pub use traits::{Backends, CacheBackend, CacheStats};
