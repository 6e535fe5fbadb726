//! Related-row loading.
//!
//! Relations are resolved through the target entity's cache controller when
//! one is registered, and straight from the target's store otherwise. The
//! result is attached to the row instance only; nothing about it is
//! persisted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use rowcache_core::{CacheResult, ConfigError, FieldValue, Filters, Row};
use tracing::trace;

use super::controller::CacheController;
use crate::lock::{rw_read, rw_write};
use crate::Store;

/// Resolves an entity's rows by primary key, typically through a cache.
pub trait RelatedResolver: Send + Sync {
    fn entity(&self) -> &str;

    /// The row with primary key `pk`, or `None` if it does not exist.
    fn resolve_pk(&self, pk: &FieldValue) -> CacheResult<Option<Row>>;
}

struct Registered {
    store: Arc<dyn Store>,
    resolver: Option<Weak<dyn RelatedResolver>>,
}

/// Entities reachable as relation targets, by entity name.
///
/// Cloning is cheap and clones share the same registrations. Controllers
/// are held weakly; once one is dropped its entity falls back to the store.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    entries: Arc<RwLock<HashMap<String, Registered>>>,
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = rw_read(&self.entries, "registry.debug");
        let mut names: Vec<&String> = entries.keys().collect();
        names.sort();
        f.debug_struct("EntityRegistry")
            .field("entities", &names)
            .finish()
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an uncached entity available as a relation target.
    pub fn register_store(&self, store: Arc<dyn Store>) {
        let name = store.schema().name().to_string();
        let mut entries = rw_write(&self.entries, "registry.register_store");
        match entries.get_mut(&name) {
            Some(entry) => entry.store = store,
            None => {
                entries.insert(
                    name,
                    Registered {
                        store,
                        resolver: None,
                    },
                );
            }
        }
    }

    pub(crate) fn register_resolver(&self, store: Arc<dyn Store>, resolver: Weak<dyn RelatedResolver>) {
        let name = store.schema().name().to_string();
        rw_write(&self.entries, "registry.register_resolver").insert(
            name,
            Registered {
                store,
                resolver: Some(resolver),
            },
        );
    }

    pub fn contains(&self, entity: &str) -> bool {
        rw_read(&self.entries, "registry.contains").contains_key(entity)
    }

    /// Whether `entity` currently resolves through a live cache controller.
    pub fn is_cached(&self, entity: &str) -> bool {
        rw_read(&self.entries, "registry.is_cached")
            .get(entity)
            .and_then(|e| e.resolver.as_ref())
            .is_some_and(|r| r.strong_count() > 0)
    }

    /// Look up the `entity` row with primary key `pk`.
    pub fn resolve(&self, entity: &str, pk: &FieldValue) -> CacheResult<Option<Row>> {
        let (store, resolver) = {
            let entries = rw_read(&self.entries, "registry.resolve");
            let entry = entries
                .get(entity)
                .ok_or_else(|| ConfigError::MissingRequired {
                    field: format!("registered store for {entity}"),
                })?;
            (
                Arc::clone(&entry.store),
                entry.resolver.as_ref().and_then(Weak::upgrade),
            )
        };

        if let Some(resolver) = resolver {
            return resolver.resolve_pk(pk);
        }

        trace!(entity, pk = %pk, "no cache controller, reading store");
        match store.find_one(&Filters::pk(pk.clone())) {
            Ok(row) => Ok(Some(row)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl CacheController {
    /// Resolve relations on `row` and attach the results to it.
    ///
    /// `relations` names the relations to load; when empty, the controller's
    /// configured related fields are used, or every declared relation if
    /// none were configured. Relations already resolved on `row` are left
    /// alone, and a null foreign key resolves to `None`.
    pub fn load_related(&self, row: &mut Row, relations: &[&str]) -> CacheResult<()> {
        let schema = self.schema();
        let names: Vec<&str> = if !relations.is_empty() {
            relations.to_vec()
        } else if !self.related_fields().is_empty() {
            self.related_fields().iter().map(String::as_str).collect()
        } else {
            schema.relations().iter().map(|r| r.name.as_str()).collect()
        };

        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            let relation = schema
                .relation(name)
                .ok_or_else(|| ConfigError::UnknownRelation {
                    entity: schema.name().to_string(),
                    relation: name.to_string(),
                })?;
            targets.push(relation);
        }

        for relation in targets {
            if row.relation_slot(&relation.name).is_resolved() {
                continue;
            }
            let foreign_key = row.value(&relation.column);
            let related = if foreign_key.is_null() {
                None
            } else {
                self.registry().resolve(&relation.target, foreign_key)?
            };
            row.set_related(relation.name.clone(), related);
        }
        Ok(())
    }
}
