//! In-memory entity instances.

use std::collections::BTreeMap;

use crate::schema::EntitySchema;
use crate::value::FieldValue;

/// Per-instance state of a relation.
#[derive(Debug, Clone, Default)]
pub enum RelationSlot {
    /// Not fetched yet.
    #[default]
    Unresolved,
    /// Fetched; `None` when the foreign reference is null or dangling.
    Resolved(Option<Box<Row>>),
}

impl RelationSlot {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

/// One entity instance: its local field values plus any relations already
/// resolved on this instance.
///
/// Equality compares entity name and field values. Relation slots are
/// ignored.
#[derive(Debug, Clone)]
pub struct Row {
    entity: String,
    values: BTreeMap<String, FieldValue>,
    relations: BTreeMap<String, RelationSlot>,
}

impl Row {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            values: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    /// Value of `field`, treating an absent field as `Null`.
    pub fn value(&self, field: &str) -> &FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        self.values.get(field).unwrap_or(&NULL)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        &self.values
    }

    /// Primary-key value according to `schema`.
    pub fn pk(&self, schema: &EntitySchema) -> &FieldValue {
        self.value(schema.pk_field())
    }

    pub fn relation_slot(&self, name: &str) -> &RelationSlot {
        static UNRESOLVED: RelationSlot = RelationSlot::Unresolved;
        self.relations.get(name).unwrap_or(&UNRESOLVED)
    }

    /// The related row if `name` has been resolved on this instance.
    ///
    /// `None` means not resolved yet; `Some(None)` means resolved to nothing.
    pub fn related(&self, name: &str) -> Option<Option<&Row>> {
        match self.relation_slot(name) {
            RelationSlot::Unresolved => None,
            RelationSlot::Resolved(row) => Some(row.as_deref()),
        }
    }

    pub fn set_related(&mut self, name: impl Into<String>, row: Option<Row>) {
        self.relations
            .insert(name.into(), RelationSlot::Resolved(row.map(Box::new)));
    }

    /// Drop any resolved relation, e.g. after the foreign column changed.
    pub fn clear_related(&mut self, name: &str) {
        self.relations.remove(name);
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_reads_as_null() {
        let row = Row::new("Brand").with("id", 1i64);
        assert_eq!(row.value("name"), &FieldValue::Null);
        assert!(row.get("name").is_none());
    }

    #[test]
    fn test_equality_ignores_relations() {
        let brand = Row::new("Brand").with("id", 1i64).with("name", "Apple");
        let plain = Row::new("Product").with("id", 5i64).with("brand_id", 1i64);
        let mut resolved = plain.clone();
        resolved.set_related("brand", Some(brand));
        assert_eq!(plain, resolved);
    }

    #[test]
    fn test_equality_compares_entity() {
        let a = Row::new("Brand").with("id", 1i64);
        let b = Row::new("Product").with("id", 1i64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_related_distinguishes_unresolved_from_none() {
        let mut row = Row::new("Product").with("brand_id", FieldValue::Null);
        assert!(row.related("brand").is_none());
        row.set_related("brand", None);
        assert_eq!(row.related("brand"), Some(None));
        assert!(row.relation_slot("brand").is_resolved());
        row.clear_related("brand");
        assert!(!row.relation_slot("brand").is_resolved());
    }
}
