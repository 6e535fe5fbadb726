//! Named multi-row result cache.
//!
//! An entry stores only the ordered primary keys of a query result, under
//! `{app_label}.{Entity}.objects.{name}`. Rows are materialized through the
//! controller's cache-only read path. If any row is missing the query is
//! re-run in full, so a caller never sees a partial list.

use std::collections::HashSet;
use std::time::Duration;

use rowcache_core::{CacheResult, EntitySchema, FieldValue, Filters, Row};
use serde_json::Value as Json;
use tracing::{debug, warn};

use super::controller::CacheController;
use super::key::derive_multi_row_key;
use crate::Store;

impl CacheController {
    /// Cached result of `producer` under `name`.
    ///
    /// When the entry exists and every referenced row is cached, rows come
    /// back in stored order without touching the store. Otherwise `producer`
    /// runs against the store, rows not already confirmed cached are written
    /// through, and the entry is replaced with the new primary-key list
    /// (expiring after `timeout`, if given).
    pub fn get_multiple<F>(
        &self,
        name: &str,
        producer: F,
        timeout: Option<Duration>,
    ) -> CacheResult<Vec<Row>>
    where
        F: FnOnce(&dyn Store) -> CacheResult<Vec<Row>>,
    {
        let schema = self.schema();
        let key = derive_multi_row_key(schema, name);
        let mut confirmed = HashSet::new();

        if let Some(pks) = self.read_pk_list(&key) {
            let mut rows = Vec::with_capacity(pks.len());
            for pk in &pks {
                if let Some(row) = self.cached(&Filters::pk(pk.clone())) {
                    confirmed.insert(pk.key_text());
                    rows.push(row);
                }
            }
            if rows.len() == pks.len() {
                debug!(entity = %schema.label(), key = %key, rows = rows.len(), "multi-row hit");
                return Ok(rows);
            }
            debug!(
                entity = %schema.label(),
                key = %key,
                missing = pks.len() - rows.len(),
                "multi-row entry incomplete, re-running query"
            );
        }

        let rows = producer(self.store().as_ref())?;

        let mut pks = Vec::with_capacity(rows.len());
        for row in &rows {
            let pk = row.pk(schema);
            if !confirmed.contains(&pk.key_text()) {
                self.save(row);
            }
            pks.push(pk.clone());
        }
        self.write_pk_list(&key, &pks, timeout);

        Ok(rows)
    }

    /// Remove the multi-row entry `name`. Cached rows are untouched.
    pub fn delete_cache_multiple(&self, name: &str) {
        let key = derive_multi_row_key(self.schema(), name);
        self.remove_key(&key);
    }

    fn read_pk_list(&self, key: &str) -> Option<Vec<FieldValue>> {
        let schema = self.schema();
        let payload = match self.backend().get(key) {
            Ok(payload) => payload?,
            Err(e) => {
                warn!(error = %e, entity = %schema.label(), key = %key, "Cache backend read failed, treating as miss");
                return None;
            }
        };

        let decoded = decode_pk_list(schema, &payload);
        if decoded.is_none() {
            warn!(entity = %schema.label(), key = %key, "Discarding undecodable multi-row entry");
        }
        decoded
    }

    fn write_pk_list(&self, key: &str, pks: &[FieldValue], timeout: Option<Duration>) {
        let schema = self.schema();
        let Some(payload) = encode_pk_list(pks) else {
            warn!(entity = %schema.label(), key = %key, "Primary keys not encodable, entry not cached");
            return;
        };
        if let Err(e) = self.backend().set(key, &payload, timeout) {
            warn!(error = %e, entity = %schema.label(), key = %key, "Cache backend write failed");
        }
    }
}

fn encode_pk_list(pks: &[FieldValue]) -> Option<String> {
    let values: Option<Vec<Json>> = pks.iter().map(FieldValue::to_json).collect();
    serde_json::to_string(&values?).ok()
}

fn decode_pk_list(schema: &EntitySchema, payload: &str) -> Option<Vec<FieldValue>> {
    let values: Vec<Json> = serde_json::from_str(payload).ok()?;
    let pk_type = schema.pk_def().field_type;
    values
        .iter()
        .map(|v| FieldValue::from_json(pk_type, v).filter(|pk| !pk.is_null()))
        .collect()
}
