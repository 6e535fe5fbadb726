//! rowcache Storage - Store Trait, In-Memory Store and Entity Cache
//!
//! Defines the store abstraction the cache sits in front of, an in-memory
//! reference store used by tests and embedders, and the cache layer itself
//! (see [`cache`]).

pub mod cache;
mod lock;

pub use cache::{
    derive_entity_key, derive_multi_row_key, Backends, CacheBackend, CacheController, CacheStats,
    EntityRegistry, GetOptions, InMemoryCacheBackend, LmdbCacheBackend, LmdbCacheError,
    RelatedResolver,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use rowcache_core::{
    CacheResult, ConfigError, EntitySchema, FieldType, FieldValue, Filters, Row, StoreError,
};
use tracing::trace;
use uuid::Uuid;

use crate::lock::{rw_read, rw_write};

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Receives notifications after rows are written to or removed from a store.
pub trait WriteObserver: Send + Sync {
    /// Called after `row` was saved. `previous` is the stored row it
    /// replaced, if any.
    fn after_save(&self, row: &Row, previous: Option<&Row>);

    /// Called after `row` was deleted.
    fn after_delete(&self, row: &Row);
}

/// A relational store holding the rows of one entity.
///
/// Filters may use either the raw primary-key field name or the `pk` alias.
pub trait Store: Send + Sync {
    fn schema(&self) -> &EntitySchema;

    /// Exactly one row matching `filters`.
    ///
    /// Fails with `StoreError::NotFound` when nothing matches and
    /// `StoreError::MultipleFound` when more than one row does.
    fn find_one(&self, filters: &Filters) -> CacheResult<Row>;

    /// Every row matching `filters`, in store order.
    fn find_many(&self, filters: &Filters) -> CacheResult<Vec<Row>>;

    /// Insert or update `row`, returning it as stored (with any generated
    /// primary key). Observers are notified on success.
    fn save(&self, row: Row) -> CacheResult<Row>;

    /// Remove the row with `row`'s primary key. Observers are notified on
    /// success.
    fn delete(&self, row: &Row) -> CacheResult<()>;

    /// Register an observer. Observers that have been dropped are skipped.
    fn subscribe(&self, observer: Weak<dyn WriteObserver>);
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// A set of in-memory tables sharing one read-query counter.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, Arc<InMemoryTable>>>,
    queries: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table for `schema`, created on first use.
    pub fn table(&self, schema: EntitySchema) -> Arc<InMemoryTable> {
        let mut tables = rw_write(&self.tables, "store.table");
        let table = tables.entry(schema.name().to_string()).or_insert_with(|| {
            Arc::new(InMemoryTable::with_counter(schema, Arc::clone(&self.queries)))
        });
        Arc::clone(table)
    }

    pub fn get_table(&self, entity: &str) -> Option<Arc<InMemoryTable>> {
        rw_read(&self.tables, "store.get_table").get(entity).cloned()
    }

    /// Number of read queries (`find_one` / `find_many`) across all tables.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn reset_query_count(&self) {
        self.queries.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct TableState {
    rows: Vec<Row>,
    next_id: i64,
}

/// In-memory table for one entity.
///
/// Assigns integer primary keys when a row is saved with a null pk (UUID
/// primary keys get a fresh v4 id), enforces unique fields and unique field
/// groups, and counts read queries.
pub struct InMemoryTable {
    schema: EntitySchema,
    state: RwLock<TableState>,
    observers: RwLock<Vec<Weak<dyn WriteObserver>>>,
    queries: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InMemoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTable")
            .field("entity", &self.schema.label())
            .field("rows", &self.len())
            .finish()
    }
}

impl InMemoryTable {
    pub fn new(schema: EntitySchema) -> Self {
        Self::with_counter(schema, Arc::new(AtomicUsize::new(0)))
    }

    fn with_counter(schema: EntitySchema, queries: Arc<AtomicUsize>) -> Self {
        Self {
            schema,
            state: RwLock::new(TableState::default()),
            observers: RwLock::new(Vec::new()),
            queries,
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.state, "table.len").rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn reset_query_count(&self) {
        self.queries.store(0, Ordering::SeqCst);
    }

    fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }

    fn raw_filters(&self, filters: &Filters) -> CacheResult<Filters> {
        if let Some(field) = filters.unknown_fields(&self.schema).first() {
            return Err(ConfigError::UnknownField {
                entity: self.schema.name().to_string(),
                field: field.to_string(),
            }
            .into());
        }
        Ok(filters.with_raw_pk(&self.schema))
    }

    fn write_failed(&self, reason: impl Into<String>) -> StoreError {
        StoreError::WriteFailed {
            entity: self.schema.name().to_string(),
            reason: reason.into(),
        }
    }

    /// Check declared types and nullability, filling absent fields with null.
    fn conform(&self, row: Row) -> Result<Row, StoreError> {
        if row.entity() != self.schema.name() {
            return Err(self.write_failed(format!("row belongs to {}", row.entity())));
        }
        if let Some(unknown) = row.values().keys().find(|k| !self.schema.has_field(k)) {
            return Err(self.write_failed(format!("unknown field {unknown}")));
        }

        let mut stored = Row::new(self.schema.name());
        for field in self.schema.fields() {
            let value = row.value(&field.name).clone();
            match value.field_type() {
                None if !field.nullable && field.name != self.schema.pk_field() => {
                    return Err(self.write_failed(format!("{} may not be null", field.name)));
                }
                Some(actual) if actual != field.field_type => {
                    return Err(self.write_failed(format!(
                        "{} expects {:?}, got {:?}",
                        field.name, field.field_type, actual
                    )));
                }
                _ => {}
            }
            stored.set(field.name.clone(), value);
        }
        Ok(stored)
    }

    fn assign_pk(&self, row: &mut Row, state: &mut TableState) -> Result<(), StoreError> {
        let pk_field = self.schema.pk_field().to_string();
        match row.pk(&self.schema).clone() {
            FieldValue::Null => match self.schema.pk_def().field_type {
                FieldType::Integer => {
                    state.next_id += 1;
                    row.set(pk_field, state.next_id);
                }
                FieldType::Uuid => row.set(pk_field, Uuid::new_v4()),
                other => {
                    return Err(self.write_failed(format!("cannot generate a {other:?} primary key")))
                }
            },
            FieldValue::Int(id) => state.next_id = state.next_id.max(id),
            _ => {}
        }
        Ok(())
    }

    fn check_unique(&self, row: &Row, rows: &[Row]) -> Result<(), StoreError> {
        let pk = row.pk(&self.schema);
        let others: Vec<&Row> = rows.iter().filter(|r| r.pk(&self.schema) != pk).collect();

        for field in self.schema.fields().iter().filter(|f| f.unique) {
            if field.name == self.schema.pk_field() {
                continue;
            }
            let value = row.value(&field.name);
            if value.is_null() {
                continue;
            }
            if others.iter().any(|r| r.value(&field.name) == value) {
                return Err(self.write_failed(format!("duplicate value for {}", field.name)));
            }
        }

        for group in self.schema.unique_together() {
            if group.iter().any(|f| row.value(f).is_null()) {
                continue;
            }
            if others
                .iter()
                .any(|r| group.iter().all(|f| r.value(f) == row.value(f)))
            {
                return Err(self.write_failed(format!("duplicate value for ({})", group.join(", "))));
            }
        }
        Ok(())
    }

    fn observers(&self) -> Vec<Arc<dyn WriteObserver>> {
        let mut observers = rw_write(&self.observers, "table.observers");
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Store for InMemoryTable {
    fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn find_one(&self, filters: &Filters) -> CacheResult<Row> {
        self.record_query();
        let raw = self.raw_filters(filters)?;
        let state = rw_read(&self.state, "table.find_one");
        let mut matches = state.rows.iter().filter(|r| raw.matches(r));

        let first = matches.next().cloned();
        let extra = matches.count();
        match first {
            None => Err(StoreError::NotFound {
                entity: self.schema.name().to_string(),
                filters: filters.to_string(),
            }
            .into()),
            Some(_) if extra > 0 => Err(StoreError::MultipleFound {
                entity: self.schema.name().to_string(),
                filters: filters.to_string(),
                count: extra + 1,
            }
            .into()),
            Some(row) => Ok(row),
        }
    }

    fn find_many(&self, filters: &Filters) -> CacheResult<Vec<Row>> {
        self.record_query();
        let raw = self.raw_filters(filters)?;
        let state = rw_read(&self.state, "table.find_many");
        Ok(state.rows.iter().filter(|r| raw.matches(r)).cloned().collect())
    }

    fn save(&self, row: Row) -> CacheResult<Row> {
        let mut row = self.conform(row)?;
        let previous = {
            let mut state = rw_write(&self.state, "table.save");
            self.assign_pk(&mut row, &mut state)?;
            self.check_unique(&row, &state.rows)?;

            let pk = row.pk(&self.schema).clone();
            match state.rows.iter().position(|r| r.pk(&self.schema) == &pk) {
                Some(index) => Some(std::mem::replace(&mut state.rows[index], row.clone())),
                None => {
                    state.rows.push(row.clone());
                    None
                }
            }
        };

        let observers = self.observers();
        trace!(entity = %self.schema.label(), observers = observers.len(), "notify after_save");
        for observer in observers {
            observer.after_save(&row, previous.as_ref());
        }
        Ok(row)
    }

    fn delete(&self, row: &Row) -> CacheResult<()> {
        let pk = row.pk(&self.schema).clone();
        let removed = {
            let mut state = rw_write(&self.state, "table.delete");
            let index = state
                .rows
                .iter()
                .position(|r| r.pk(&self.schema) == &pk)
                .ok_or_else(|| StoreError::NotFound {
                    entity: self.schema.name().to_string(),
                    filters: Filters::pk(pk.clone()).to_string(),
                })?;
            state.rows.remove(index)
        };

        let observers = self.observers();
        trace!(entity = %self.schema.label(), observers = observers.len(), "notify after_delete");
        for observer in observers {
            observer.after_delete(&removed);
        }
        Ok(())
    }

    fn subscribe(&self, observer: Weak<dyn WriteObserver>) {
        rw_write(&self.observers, "table.subscribe").push(observer);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rowcache_core::{CacheError, FieldDef};
    use std::sync::Mutex;

    fn brand_schema() -> EntitySchema {
        EntitySchema::builder("shop", "Brand")
            .primary_key("id", FieldType::Integer)
            .field(FieldDef::new("name", FieldType::Text).unique())
            .build()
            .unwrap()
    }

    fn product_schema() -> EntitySchema {
        EntitySchema::builder("shop", "Product")
            .primary_key("id", FieldType::Integer)
            .field(FieldDef::new("code", FieldType::Uuid).unique())
            .field(FieldDef::new("brand_id", FieldType::Integer).nullable())
            .field(FieldDef::new("name", FieldType::Text))
            .relation("brand", "brand_id", "Brand")
            .unique_together(&["brand_id", "name"])
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl WriteObserver for Recorder {
        fn after_save(&self, row: &Row, previous: Option<&Row>) {
            self.events.lock().unwrap().push(format!(
                "save {} replaced={}",
                row.value("id"),
                previous.is_some()
            ));
        }

        fn after_delete(&self, row: &Row) {
            self.events
                .lock()
                .unwrap()
                .push(format!("delete {}", row.value("id")));
        }
    }

    #[test]
    fn test_save_assigns_sequential_ids() {
        let table = InMemoryTable::new(brand_schema());
        let a = table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        let b = table.save(Row::new("Brand").with("name", "Samsung")).unwrap();
        assert_eq!(a.value("id"), &FieldValue::Int(1));
        assert_eq!(b.value("id"), &FieldValue::Int(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_explicit_id_advances_sequence() {
        let table = InMemoryTable::new(brand_schema());
        table
            .save(Row::new("Brand").with("id", 10i64).with("name", "Apple"))
            .unwrap();
        let next = table.save(Row::new("Brand").with("name", "Samsung")).unwrap();
        assert_eq!(next.value("id"), &FieldValue::Int(11));
    }

    #[test]
    fn test_find_one_by_alias_and_raw_pk() {
        let table = InMemoryTable::new(brand_schema());
        let saved = table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        assert_eq!(table.find_one(&Filters::pk(1i64)).unwrap(), saved);
        assert_eq!(table.find_one(&Filters::new().eq("id", 1i64)).unwrap(), saved);
        assert_eq!(table.query_count(), 2);
    }

    #[test]
    fn test_find_one_not_found_and_multiple() {
        let table = InMemoryTable::new(product_schema());
        let err = table.find_one(&Filters::pk(1i64)).unwrap_err();
        assert!(err.is_not_found());

        for name in ["a", "b"] {
            table
                .save(
                    Row::new("Product")
                        .with("code", Uuid::new_v4())
                        .with("brand_id", 1i64)
                        .with("name", name),
                )
                .unwrap();
        }
        let err = table
            .find_one(&Filters::new().eq("brand_id", 1i64))
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Store(StoreError::MultipleFound { count: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_filter_field_is_config_error() {
        let table = InMemoryTable::new(brand_schema());
        let err = table
            .find_many(&Filters::new().eq("colour", "red"))
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::UnknownField { .. })));
    }

    #[test]
    fn test_unique_field_violation() {
        let table = InMemoryTable::new(brand_schema());
        table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        let err = table.save(Row::new("Brand").with("name", "Apple")).unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::WriteFailed { .. })));
    }

    #[test]
    fn test_unique_together_skips_nulls() {
        let table = InMemoryTable::new(product_schema());
        for _ in 0..2 {
            table
                .save(
                    Row::new("Product")
                        .with("code", Uuid::new_v4())
                        .with("brand_id", FieldValue::Null)
                        .with("name", "Orphan"),
                )
                .unwrap();
        }
        let row = |code| {
            Row::new("Product")
                .with("code", code)
                .with("brand_id", 1i64)
                .with("name", "Phone")
        };
        table.save(row(Uuid::new_v4())).unwrap();
        assert!(table.save(row(Uuid::new_v4())).is_err());
    }

    #[test]
    fn test_type_and_null_checks() {
        let table = InMemoryTable::new(brand_schema());
        assert!(table.save(Row::new("Brand").with("name", 5i64)).is_err());
        assert!(table.save(Row::new("Brand")).is_err());
        assert!(table.save(Row::new("Product").with("name", "x")).is_err());
    }

    #[test]
    fn test_observers_are_notified_and_dropped_ones_skipped() {
        let table = InMemoryTable::new(brand_schema());
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn WriteObserver> = recorder.clone();
        table.subscribe(Arc::downgrade(&observer));

        let dropped: Arc<dyn WriteObserver> = Arc::new(Recorder::default());
        table.subscribe(Arc::downgrade(&dropped));
        drop(dropped);

        let saved = table.save(Row::new("Brand").with("name", "Apple")).unwrap();
        let renamed = table.save(saved.clone().with("name", "Apple Inc")).unwrap();
        table.delete(&renamed).unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["save 1 replaced=false", "save 1 replaced=true", "delete 1"]
        );
        assert_eq!(rw_read(&table.observers, "test").len(), 1);
    }

    #[test]
    fn test_delete_missing_row_is_not_found() {
        let table = InMemoryTable::new(brand_schema());
        let err = table
            .delete(&Row::new("Brand").with("id", 9i64))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_store_tables_share_query_counter() {
        let store = InMemoryStore::new();
        let brands = store.table(brand_schema());
        let products = store.table(product_schema());
        let _ = brands.find_many(&Filters::new());
        let _ = products.find_many(&Filters::new());
        assert_eq!(store.query_count(), 2);
        assert!(store.get_table("Brand").is_some());
        store.reset_query_count();
        assert_eq!(brands.query_count(), 0);
    }
}
