//! Equality filters used for cache lookups and store queries.
//!
//! A [`Filters`] value is an ordered set of `field = value` pairs. Setting the
//! same field twice keeps the last value.

use std::fmt;

use crate::row::Row;
use crate::schema::{EntitySchema, PK_ALIAS};
use crate::value::FieldValue;

/// One `field = value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: FieldValue,
}

impl FieldFilter {
    /// Whether `row` satisfies this predicate.
    ///
    /// A `Null` filter matches only a null (or absent) field. Otherwise the
    /// stringified forms are compared.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.value(&self.field);
        match (&self.value, actual) {
            (FieldValue::Null, actual) => actual.is_null(),
            (_, FieldValue::Null) => false,
            (expected, actual) => expected.key_text() == actual.key_text(),
        }
    }
}

/// Ordered set of equality filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    pairs: Vec<FieldFilter>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single `pk = value` filter.
    pub fn pk(value: impl Into<FieldValue>) -> Self {
        Self::new().eq(PK_ALIAS, value)
    }

    /// Add (or replace) an equality filter.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        let field = field.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|p| p.field == field) {
            Some(existing) => existing.value = value,
            None => self.pairs.push(FieldFilter { field, value }),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.pairs.iter().find(|p| p.field == field).map(|p| &p.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldFilter> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Field names in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|p| p.field.as_str())
    }

    /// Rewrite the raw primary-key field name to the `pk` alias, so that
    /// `id=1` and `pk=1` address the same cache entry.
    pub fn with_pk_alias(&self, schema: &EntitySchema) -> Self {
        self.rename(schema.pk_field(), PK_ALIAS)
    }

    /// Rewrite the `pk` alias to the raw primary-key field for store queries.
    pub fn with_raw_pk(&self, schema: &EntitySchema) -> Self {
        self.rename(PK_ALIAS, schema.pk_field())
    }

    fn rename(&self, from: &str, to: &str) -> Self {
        let mut out = Self::new();
        for pair in &self.pairs {
            let field = if pair.field == from { to } else { pair.field.as_str() };
            out.insert(field, pair.value.clone());
        }
        out
    }

    /// Whether every predicate holds for `row`. Field names must already be
    /// raw (see [`Filters::with_raw_pk`]).
    pub fn matches(&self, row: &Row) -> bool {
        self.pairs.iter().all(|p| p.matches(row))
    }

    /// Field names not declared on `schema` (the `pk` alias is accepted).
    pub fn unknown_fields<'a>(&'a self, schema: &EntitySchema) -> Vec<&'a str> {
        self.fields().filter(|f| !schema.has_field(f)).collect()
    }
}

impl fmt::Display for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", pair.field, pair.value)?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Filters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut filters = Self::new();
        for (field, value) in iter {
            filters.insert(field, value);
        }
        filters
    }
}
