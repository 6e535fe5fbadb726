//! rowcache Core - Entity Types
//!
//! Pure data structures shared by the cache layer and its stores: field
//! values, entity schemas, rows, equality filters, settings and errors.
//! Nothing here talks to a store or a cache backend.

pub mod config;
pub mod error;
pub mod filter;
pub mod row;
pub mod schema;
pub mod value;

pub use config::{CacheOptions, CacheSettings, KeySet, KeySpec, DEFAULT_BACKEND};
pub use error::{BackendError, CacheError, CacheResult, CodecError, ConfigError, StoreError};
pub use filter::{FieldFilter, Filters};
pub use row::{RelationSlot, Row};
pub use schema::{EntitySchema, EntitySchemaBuilder, FieldDef, RelationDef, PK_ALIAS};
pub use value::{FieldType, FieldValue};
