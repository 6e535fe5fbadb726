//! rowcache Test Utilities
//!
//! Shared test infrastructure for the rowcache workspace:
//! - Brand/Product fixture schemas and a wired-up shop fixture
//! - Proptest generators for values, rows and filters
//! - A cache backend that can be switched into failure mode
//! - A cache backend that records the TTL of every write
//! - Tracing setup for tests

pub use rowcache_core::{
    BackendError, CacheError, CacheOptions, CacheResult, CacheSettings, CodecError, ConfigError,
    EntitySchema, FieldDef, FieldType, FieldValue, Filters, KeySpec, RelationSlot, Row,
    StoreError,
};
pub use rowcache_storage::{
    Backends, CacheBackend, CacheController, CacheStats, EntityRegistry, InMemoryCacheBackend,
    InMemoryStore, InMemoryTable, Store,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call has an effect.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// FAILING BACKEND
// ============================================================================

/// Cache backend wrapper that fails every call while switched on.
///
/// Calls made while failing are counted and never reach the inner backend.
#[derive(Debug, Default)]
pub struct FailingBackend {
    inner: InMemoryCacheBackend,
    failing: AtomicBool,
    failed_calls: AtomicUsize,
}

impl FailingBackend {
    /// A backend that fails from the start.
    pub fn new() -> Self {
        let backend = Self::default();
        backend.set_failing(true);
        backend
    }

    /// A backend that works until switched into failure mode.
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn failed_calls(&self) -> usize {
        self.failed_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryCacheBackend {
        &self.inner
    }

    fn check(&self, operation: &str) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Unavailable {
                operation: operation.to_string(),
                reason: "backend switched off".to_string(),
            });
        }
        Ok(())
    }
}

impl CacheBackend for FailingBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.check("get")?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackendError> {
        self.check("set")?;
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.check("delete")?;
        self.inner.delete(key)
    }

    fn stats(&self) -> Result<CacheStats, BackendError> {
        self.check("stats")?;
        self.inner.stats()
    }
}

// ============================================================================
// RECORDING BACKEND
// ============================================================================

/// In-memory backend that records the TTL of every write.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    inner: InMemoryCacheBackend,
    writes: Mutex<Vec<(String, Option<Duration>)>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL of the most recent write to `key`, or `None` if it was never written.
    pub fn last_ttl(&self, key: &str) -> Option<Option<Duration>> {
        self.writes()
            .into_iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, ttl)| ttl)
    }

    /// Every `(key, ttl)` write, in order.
    pub fn writes(&self) -> Vec<(String, Option<Duration>)> {
        match self.writes.lock() {
            Ok(writes) => writes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn inner(&self) -> &InMemoryCacheBackend {
        &self.inner
    }
}

impl CacheBackend for RecordingBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackendError> {
        let entry = (key.to_string(), ttl);
        match self.writes.lock() {
            Ok(mut writes) => writes.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.inner.delete(key)
    }

    fn stats(&self) -> Result<CacheStats, BackendError> {
        self.inner.stats()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built schemas and a wired-up shop for cache scenarios.

    use super::*;
    use uuid::Uuid;

    /// `shop.Brand`: integer pk, unique name.
    pub fn brand_schema() -> EntitySchema {
        EntitySchema::builder("shop", "Brand")
            .primary_key("id", FieldType::Integer)
            .field(FieldDef::new("name", FieldType::Text).unique())
            .build()
            .expect("brand schema is valid")
    }

    /// `shop.Product`: integer pk, unique UUID code, nullable brand reference,
    /// name unique per brand, optional manual file.
    pub fn product_schema() -> EntitySchema {
        EntitySchema::builder("shop", "Product")
            .primary_key("id", FieldType::Integer)
            .field(FieldDef::new("code", FieldType::Uuid).unique())
            .field(FieldDef::new("brand_id", FieldType::Integer).nullable())
            .field(FieldDef::new("name", FieldType::Text))
            .field(FieldDef::new("manual", FieldType::File).nullable())
            .relation("brand", "brand_id", "Brand")
            .unique_together(&["brand_id", "name"])
            .build()
            .expect("product schema is valid")
    }

    /// Product cache options: keyed by code and by (brand_id, name), with the
    /// brand relation loadable.
    pub fn product_options() -> CacheOptions {
        CacheOptions::default()
            .key("code")
            .key(["brand_id", "name"])
            .related("brand")
    }

    /// Brand and Product tables behind cache controllers sharing one backend.
    pub struct Shop {
        pub store: InMemoryStore,
        pub backend: Arc<dyn CacheBackend>,
        pub registry: EntityRegistry,
        pub brands: Arc<CacheController>,
        pub products: Arc<CacheController>,
        pub brand_table: Arc<InMemoryTable>,
        pub product_table: Arc<InMemoryTable>,
    }

    impl Shop {
        /// Shop on a fresh in-memory backend.
        pub fn new() -> Self {
            Self::with_backend(Arc::new(InMemoryCacheBackend::new()))
        }

        /// Shop on `backend`, registered as `"default"`.
        pub fn with_backend(backend: Arc<dyn CacheBackend>) -> Self {
            Self::with_product_options(backend, product_options())
        }

        /// Shop on `backend` with custom product cache options.
        pub fn with_product_options(backend: Arc<dyn CacheBackend>, options: CacheOptions) -> Self {
            init_tracing();
            let store = InMemoryStore::new();
            let registry = EntityRegistry::new();
            let backends = Backends::single("default", Arc::clone(&backend));

            let brand_table = store.table(brand_schema());
            let product_table = store.table(product_schema());

            let brands = CacheController::register(
                brand_table.clone(),
                &backends,
                &registry,
                CacheOptions::default().key("name"),
            )
            .expect("brand controller registers");
            let products =
                CacheController::register(product_table.clone(), &backends, &registry, options)
                    .expect("product controller registers");

            Self {
                store,
                backend,
                registry,
                brands,
                products,
                brand_table,
                product_table,
            }
        }

        pub fn add_brand(&self, name: &str) -> Row {
            self.brand_table
                .save(Row::new("Brand").with("name", name))
                .expect("brand saves")
        }

        pub fn add_product(&self, brand: &Row, name: &str) -> Row {
            self.product_table
                .save(
                    Row::new("Product")
                        .with("code", Uuid::new_v4())
                        .with("brand_id", brand.value("id").clone())
                        .with("name", name),
                )
                .expect("product saves")
        }

        pub fn query_count(&self) -> usize {
            self.store.query_count()
        }

        pub fn reset_query_count(&self) {
            self.store.reset_query_count();
        }
    }

    impl Default for Shop {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for rowcache values, rows and filters.

    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a timestamp between 1970 and 2100.
    pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        (0i64..4_102_444_800, 0u32..1_000_000_000)
            .prop_map(|(secs, nanos)| DateTime::from_timestamp(secs, nanos).unwrap_or_default())
    }

    /// Generate a non-null value of `field_type`.
    pub fn arb_field_value(field_type: FieldType) -> BoxedStrategy<FieldValue> {
        match field_type {
            FieldType::Bool => any::<bool>().prop_map(FieldValue::Bool).boxed(),
            FieldType::Integer => any::<i64>().prop_map(FieldValue::Int).boxed(),
            FieldType::Float => (-1.0e12f64..1.0e12).prop_map(FieldValue::Float).boxed(),
            FieldType::Text => "[a-zA-Z0-9 ]{0,24}".prop_map(FieldValue::Text).boxed(),
            FieldType::Uuid => arb_uuid().prop_map(FieldValue::Uuid).boxed(),
            FieldType::Timestamp => arb_timestamp().prop_map(FieldValue::Timestamp).boxed(),
            FieldType::Json => any::<i32>()
                .prop_map(|n| FieldValue::Json(serde_json::json!({ "n": n })))
                .boxed(),
            FieldType::File => "[a-z]{1,8}/[a-z]{1,8}\\.pdf".prop_map(FieldValue::File).boxed(),
        }
    }

    /// Generate a name usable as a Brand or Product name.
    pub fn arb_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{2,10}"
    }

    /// Generate a complete, storable Product row (pk and brand set).
    pub fn arb_product_row() -> impl Strategy<Value = Row> {
        (1i64..10_000, arb_uuid(), 1i64..100, arb_name()).prop_map(|(id, code, brand, name)| {
            Row::new("Product")
                .with("id", id)
                .with("code", code)
                .with("brand_id", brand)
                .with("name", name)
                .with("manual", FieldValue::Null)
        })
    }

    /// Generate filters over distinct field names, paired with the same
    /// filters in reverse insertion order.
    pub fn arb_filters_pair() -> impl Strategy<Value = (Filters, Filters)> {
        proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 1..6).prop_map(|pairs| {
            let forward: Filters = pairs.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            let reverse: Filters = pairs.iter().rev().map(|(k, v)| (k.as_str(), *v)).collect();
            (forward, reverse)
        })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for cache scenarios.

    use super::*;

    /// Assert that `result` is a store-level `NotFound`.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    /// Assert that running `f` performs exactly `expected` store reads.
    #[track_caller]
    pub fn assert_queries<R>(store: &InMemoryStore, expected: usize, f: impl FnOnce() -> R) -> R {
        let before = store.query_count();
        let result = f();
        let actual = store.query_count() - before;
        assert_eq!(actual, expected, "expected {expected} store queries, got {actual}");
        result
    }
}
