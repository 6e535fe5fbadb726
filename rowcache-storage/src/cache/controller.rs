//! Single-entity cache controller.
//!
//! One controller fronts one entity's store. Rows are cached under every
//! member of the entity's key set (the primary key plus any declared unique
//! field or field tuple), so a lookup by any of those combinations can be
//! served without touching the store. The controller observes the store's
//! writes and deletes and keeps every key in step.

use std::sync::Arc;
use std::time::Duration;

use rowcache_core::{
    CacheOptions, CacheResult, ConfigError, EntitySchema, FieldValue, Filters, KeySet, KeySpec,
    Row,
};
use tracing::{debug, trace, warn};

use super::key::derive_entity_key;
use super::payload;
use super::related::{EntityRegistry, RelatedResolver};
use super::traits::{Backends, CacheBackend};
use crate::{Store, WriteObserver};

/// Per-call options for [`CacheController::get_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Skip the cache read and go straight to the store. The cache is still
    /// repopulated with the fetched row.
    pub force_store: bool,
}

impl GetOptions {
    pub fn forced() -> Self {
        Self { force_store: true }
    }
}

/// Read-through, write-through cache for one entity.
pub struct CacheController {
    store: Arc<dyn Store>,
    backend: Arc<dyn CacheBackend>,
    backend_name: String,
    keys: KeySet,
    related_fields: Vec<String>,
    timeout: Option<Duration>,
    registry: EntityRegistry,
}

impl std::fmt::Debug for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheController")
            .field("entity", &self.schema().label())
            .field("backend", &self.backend_name)
            .field("keys", &self.keys)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CacheController {
    /// Build a controller for `store` and wire it up.
    ///
    /// Validates `options` against the store's schema, resolves the backend
    /// by name, subscribes the controller to the store's writes and registers
    /// it for related-row loading.
    pub fn register(
        store: Arc<dyn Store>,
        backends: &Backends,
        registry: &EntityRegistry,
        options: CacheOptions,
    ) -> CacheResult<Arc<Self>> {
        let schema = store.schema();
        let keys = KeySet::new(schema, &options.fields)?;

        for relation in &options.related_fields {
            if schema.relation(relation).is_none() {
                return Err(ConfigError::UnknownRelation {
                    entity: schema.name().to_string(),
                    relation: relation.clone(),
                }
                .into());
            }
        }

        let backend = backends.resolve(&options.backend)?;

        let controller = Arc::new(Self {
            store: Arc::clone(&store),
            backend,
            backend_name: options.backend,
            keys,
            related_fields: options.related_fields,
            timeout: options.timeout,
            registry: registry.clone(),
        });

        let observer: Arc<dyn WriteObserver> = controller.clone();
        store.subscribe(Arc::downgrade(&observer));

        let resolver: Arc<dyn RelatedResolver> = controller.clone();
        registry.register_resolver(store, Arc::downgrade(&resolver));

        debug!(
            entity = %controller.schema().label(),
            backend = %controller.backend_name,
            keys = controller.keys.len(),
            "registered cache controller"
        );
        Ok(controller)
    }

    pub fn schema(&self) -> &EntitySchema {
        self.store.schema()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn key_set(&self) -> &KeySet {
        &self.keys
    }

    pub fn related_fields(&self) -> &[String] {
        &self.related_fields
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Fetch exactly one row matching `filters`, from cache when possible.
    ///
    /// Fails with `StoreError::NotFound` when no row matches.
    pub fn get(&self, filters: &Filters) -> CacheResult<Row> {
        self.get_with(filters, GetOptions::default())
    }

    /// [`CacheController::get`] bypassing the cache read.
    pub fn get_forced(&self, filters: &Filters) -> CacheResult<Row> {
        self.get_with(filters, GetOptions::forced())
    }

    pub fn get_with(&self, filters: &Filters, options: GetOptions) -> CacheResult<Row> {
        let schema = self.schema();
        if let Some(field) = filters.unknown_fields(schema).first() {
            return Err(ConfigError::UnknownField {
                entity: schema.name().to_string(),
                field: field.to_string(),
            }
            .into());
        }

        // Null values are never written under a key, and "null" text would
        // otherwise share one.
        let has_null = filters.iter().any(|f| f.value.is_null());
        if !options.force_store && !has_null {
            if let Some(row) = self.cached(filters) {
                return Ok(row);
            }
        }

        let row = self.store.find_one(&filters.with_raw_pk(schema))?;
        self.save(&row);
        Ok(row)
    }

    /// [`CacheController::get`], with `NotFound` mapped to `None`.
    pub fn get_or_none(&self, filters: &Filters) -> CacheResult<Option<Row>> {
        match self.get(filters) {
            Ok(row) => Ok(Some(row)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read `filters` from the cache only. Never touches the store.
    ///
    /// Backend failures and undecodable payloads read as a miss.
    pub fn cached(&self, filters: &Filters) -> Option<Row> {
        let schema = self.schema();
        let key = derive_entity_key(schema, filters);

        let payload = match self.backend.get(&key) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(entity = %schema.label(), key = %key, filters = %filters, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    entity = %schema.label(),
                    key = %key,
                    "Cache backend read failed, treating as miss"
                );
                return None;
            }
        };

        match payload::decode(schema, &payload) {
            Ok(row) => {
                debug!(entity = %schema.label(), key = %key, filters = %filters, "cache hit");
                Some(row)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    entity = %schema.label(),
                    key = %key,
                    "Discarding undecodable cached payload"
                );
                None
            }
        }
    }

    /// Every cache key `row` is currently addressable by.
    ///
    /// Single-field keys with a null value and tuple keys with any null
    /// component are left out.
    pub fn keys_for(&self, row: &Row) -> Vec<String> {
        let schema = self.schema();
        self.keys
            .iter()
            .filter_map(|spec| {
                let filters = key_filters(schema, spec, row)?;
                Some(derive_entity_key(schema, &filters))
            })
            .collect()
    }

    /// Write `row`'s payload under every applicable key.
    ///
    /// A row that cannot be encoded is evicted from those keys instead.
    /// Backend failures are logged; the cache is best effort.
    pub fn save(&self, row: &Row) {
        let schema = self.schema();
        let payload = match payload::encode(schema, row) {
            Ok(payload) => payload,
            Err(e) => {
                // Older payloads under these keys no longer match the store.
                warn!(error = %e, entity = %schema.label(), "Row not cacheable, evicting its keys");
                for key in self.keys_for(row) {
                    self.remove_key(&key);
                }
                return;
            }
        };

        for key in self.keys_for(row) {
            trace!(entity = %schema.label(), key = %key, "cache set");
            if let Err(e) = self.backend.set(&key, &payload, self.timeout) {
                warn!(error = %e, entity = %schema.label(), key = %key, "Cache backend write failed");
            }
        }
    }

    /// Remove `row`'s payload from every applicable key.
    ///
    /// Multi-row entries referencing the row are left alone; they notice the
    /// missing row on their next read and rebuild.
    pub fn delete(&self, row: &Row) {
        let schema = self.schema();
        for key in self.keys_for(row) {
            self.remove_key(&key);
        }
        trace!(entity = %schema.label(), pk = %row.pk(schema), "cache entries removed");
    }

    pub(crate) fn remove_key(&self, key: &str) {
        trace!(entity = %self.schema().label(), key = %key, "cache delete");
        if let Err(e) = self.backend.delete(key) {
            warn!(error = %e, entity = %self.schema().label(), key = %key, "Cache backend delete failed");
        }
    }
}

/// Filters addressing `row` through `spec`, or `None` if a value is null.
fn key_filters(schema: &EntitySchema, spec: &KeySpec, row: &Row) -> Option<Filters> {
    let mut filters = Filters::new();
    for field in spec.fields() {
        let value: &FieldValue = row.value(schema.resolve_alias(field));
        if value.is_null() {
            return None;
        }
        filters.insert(field, value.clone());
    }
    Some(filters)
}

impl WriteObserver for CacheController {
    fn after_save(&self, row: &Row, previous: Option<&Row>) {
        // Keys the old version answered to but the new one no longer does
        // would otherwise keep serving the old payload.
        if let Some(previous) = previous {
            let current = self.keys_for(row);
            for key in self.keys_for(previous) {
                if !current.contains(&key) {
                    self.remove_key(&key);
                }
            }
        }
        self.save(row);
    }

    fn after_delete(&self, row: &Row) {
        self.delete(row);
    }
}

impl RelatedResolver for CacheController {
    fn entity(&self) -> &str {
        self.schema().name()
    }

    fn resolve_pk(&self, pk: &FieldValue) -> CacheResult<Option<Row>> {
        self.get_or_none(&Filters::pk(pk.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheBackend;
    use crate::InMemoryTable;
    use rowcache_core::{CacheError, FieldDef, FieldType, StoreError};

    fn brand_schema() -> EntitySchema {
        EntitySchema::builder("shop", "Brand")
            .primary_key("id", FieldType::Integer)
            .field(FieldDef::new("name", FieldType::Text).unique())
            .field(FieldDef::new("slug", FieldType::Text).nullable())
            .build()
            .unwrap()
    }

    struct Fixture {
        table: Arc<InMemoryTable>,
        backend: Arc<InMemoryCacheBackend>,
        controller: Arc<CacheController>,
    }

    fn fixture(options: CacheOptions) -> Fixture {
        let table = Arc::new(InMemoryTable::new(brand_schema()));
        let backend = Arc::new(InMemoryCacheBackend::new());
        let backends = Backends::single("default", backend.clone());
        let registry = EntityRegistry::new();
        let controller =
            CacheController::register(table.clone(), &backends, &registry, options).unwrap();
        Fixture {
            table,
            backend,
            controller,
        }
    }

    #[test]
    fn test_save_populates_pk_key_without_store_reads() {
        let f = fixture(CacheOptions::default());
        let saved = f.table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        f.table.reset_query_count();

        let row = f.controller.get(&Filters::pk(1i64)).unwrap();
        assert_eq!(row, saved);
        assert_eq!(f.table.query_count(), 0);
    }

    #[test]
    fn test_miss_reads_store_once_then_hits() {
        let f = fixture(CacheOptions::default().key("name"));
        f.table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        f.backend.clear();
        f.table.reset_query_count();

        f.controller.get(&Filters::new().eq("name", "Apple")).unwrap();
        assert_eq!(f.table.query_count(), 1);
        f.controller.get(&Filters::new().eq("name", "Apple")).unwrap();
        f.controller.get(&Filters::pk(1i64)).unwrap();
        assert_eq!(f.table.query_count(), 1);
    }

    #[test]
    fn test_forced_get_reads_store() {
        let f = fixture(CacheOptions::default());
        f.table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        f.table.reset_query_count();

        f.controller.get_forced(&Filters::pk(1i64)).unwrap();
        assert_eq!(f.table.query_count(), 1);
    }

    #[test]
    fn test_null_single_field_key_is_skipped() {
        let f = fixture(CacheOptions::default().key("slug"));
        let row = f.table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        assert_eq!(f.controller.keys_for(&row).len(), 1);
        assert_eq!(f.backend.len(), 1);
    }

    #[test]
    fn test_null_filter_is_not_served_by_null_text_entry() {
        let f = fixture(CacheOptions::default().key("slug"));
        f.table
            .save(Row::new("Brand").with("name", "Apple").with("slug", "null"))
            .unwrap();
        let unslugged = f.table.save(Row::new("Brand").with("name", "Nokia")).unwrap();
        f.table.reset_query_count();

        let row = f
            .controller
            .get(&Filters::new().eq("slug", FieldValue::Null))
            .unwrap();
        assert_eq!(row, unslugged);
        assert_eq!(f.table.query_count(), 1);
    }

    #[test]
    fn test_rename_drops_stale_key() {
        let f = fixture(CacheOptions::default().key("name"));
        let row = f.table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        f.table.save(row.with("name", "Apple Inc")).unwrap();

        assert!(f.controller.cached(&Filters::new().eq("name", "Apple")).is_none());
        assert!(f
            .controller
            .cached(&Filters::new().eq("name", "Apple Inc"))
            .is_some());
    }

    #[test]
    fn test_delete_clears_all_keys() {
        let f = fixture(CacheOptions::default().key("name"));
        let row = f.table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        f.table.delete(&row).unwrap();
        assert!(f.backend.is_empty());

        let err = f.controller.get(&Filters::new().eq("name", "Apple")).unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_get_or_none() {
        let f = fixture(CacheOptions::default());
        assert_eq!(f.controller.get_or_none(&Filters::pk(42i64)).unwrap(), None);
    }

    #[test]
    fn test_unknown_filter_field_is_rejected() {
        let f = fixture(CacheOptions::default());
        let err = f
            .controller
            .get(&Filters::new().eq("colour", "red"))
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::UnknownField { .. })));
    }

    #[test]
    fn test_register_rejects_unknown_key_field_relation_and_backend() {
        let table: Arc<dyn Store> = Arc::new(InMemoryTable::new(brand_schema()));
        let backends = Backends::single("default", Arc::new(InMemoryCacheBackend::new()));
        let registry = EntityRegistry::new();

        let bad_key = CacheController::register(
            table.clone(),
            &backends,
            &registry,
            CacheOptions::default().key("colour"),
        );
        assert!(matches!(
            bad_key,
            Err(CacheError::Config(ConfigError::UnknownField { .. }))
        ));

        let bad_relation = CacheController::register(
            table.clone(),
            &backends,
            &registry,
            CacheOptions::default().related("owner"),
        );
        assert!(matches!(
            bad_relation,
            Err(CacheError::Config(ConfigError::UnknownRelation { .. }))
        ));

        let bad_backend = CacheController::register(
            table,
            &backends,
            &registry,
            CacheOptions::default().backend("sessions"),
        );
        assert!(matches!(
            bad_backend,
            Err(CacheError::Config(ConfigError::UnknownBackend { .. }))
        ));
    }

    fn reading_schema() -> EntitySchema {
        EntitySchema::builder("lab", "Reading")
            .primary_key("id", FieldType::Integer)
            .field(FieldDef::new("value", FieldType::Float))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unencodable_update_evicts_previous_payload() {
        let table = Arc::new(InMemoryTable::new(reading_schema()));
        let backend = Arc::new(InMemoryCacheBackend::new());
        let controller = CacheController::register(
            table.clone(),
            &Backends::single("default", backend.clone()),
            &EntityRegistry::new(),
            CacheOptions::default(),
        )
        .unwrap();

        let row = table.save(Row::new("Reading").with("value", 1.0)).unwrap();
        assert_eq!(backend.len(), 1);
        table.save(row.with("value", f64::NAN)).unwrap();
        assert!(backend.is_empty());
        table.reset_query_count();

        let current = controller.get(&Filters::pk(1i64)).unwrap();
        assert!(matches!(current.value("value"), FieldValue::Float(v) if v.is_nan()));
        assert_eq!(table.query_count(), 1);
        assert!(controller.cached(&Filters::pk(1i64)).is_none());
    }

    #[test]
    fn test_timeout_is_applied_to_saved_payloads() {
        let f = fixture(CacheOptions::default().timeout(Some(Duration::ZERO)));
        f.table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        f.table.reset_query_count();

        assert!(f.controller.cached(&Filters::pk(1i64)).is_none());
        f.controller.get(&Filters::pk(1i64)).unwrap();
        assert_eq!(f.table.query_count(), 1);
        assert_eq!(f.backend.stats().unwrap().expirations, 1);
    }

    #[test]
    fn test_corrupt_payload_falls_back_to_store() {
        let f = fixture(CacheOptions::default());
        f.table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        let key = derive_entity_key(f.controller.schema(), &Filters::pk(1i64));
        f.backend.set(&key, "{\"id\": 1}", None).unwrap();
        f.table.reset_query_count();

        let row = f.controller.get(&Filters::pk(1i64)).unwrap();
        assert_eq!(row.value("name"), &FieldValue::from("Apple"));
        assert_eq!(f.table.query_count(), 1);
    }
}
