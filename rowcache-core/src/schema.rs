//! Entity schemas.
//!
//! A schema is declared once, explicitly, when an entity is registered with
//! the cache: the primary key, the ordered list of locally stored fields and
//! the relations pointing at other entities. Nothing is discovered at
//! runtime.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult, ConfigError};
use crate::value::FieldType;

/// Canonical lookup alias for an entity's primary key.
pub const PK_ALIAS: &str = "pk";

/// A locally stored scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub unique: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            unique: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A foreign-key style reference to another entity.
///
/// `column` is the local scalar field holding the target's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub column: String,
    pub target: String,
}

/// Immutable description of one cached entity.
///
/// Deserialized schemas go through the same validation as [`EntitySchemaBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SchemaRepr")]
pub struct EntitySchema {
    app_label: String,
    name: String,
    pk_field: String,
    fields: Vec<FieldDef>,
    relations: Vec<RelationDef>,
    unique_together: Vec<Vec<String>>,
}

impl EntitySchema {
    /// Start declaring a schema for `name` within `app_label`.
    pub fn builder(app_label: impl Into<String>, name: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            app_label: app_label.into(),
            name: name.into(),
            pk_field: None,
            fields: Vec::new(),
            relations: Vec::new(),
            unique_together: Vec::new(),
        }
    }

    pub fn app_label(&self) -> &str {
        &self.app_label
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `app_label.Name`, used in log fields and error messages.
    pub fn label(&self) -> String {
        format!("{}.{}", self.app_label, self.name)
    }

    /// The store's raw primary-key field name.
    pub fn pk_field(&self) -> &str {
        &self.pk_field
    }

    pub fn pk_def(&self) -> &FieldDef {
        // `build` rejects schemas whose pk is not a declared field
        self.field(&self.pk_field).unwrap_or(&self.fields[0])
    }

    /// Locally stored fields in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        let name = self.resolve_alias(name);
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Field-name groups whose combined values must be unique.
    pub fn unique_together(&self) -> &[Vec<String>] {
        &self.unique_together
    }

    /// Map the `pk` alias to the raw primary-key field; other names pass through.
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        if name == PK_ALIAS {
            &self.pk_field
        } else {
            name
        }
    }
}

/// Serialized form of [`EntitySchema`], validated on the way in.
#[derive(Deserialize)]
struct SchemaRepr {
    app_label: String,
    name: String,
    pk_field: String,
    fields: Vec<FieldDef>,
    #[serde(default)]
    relations: Vec<RelationDef>,
    #[serde(default)]
    unique_together: Vec<Vec<String>>,
}

impl TryFrom<SchemaRepr> for EntitySchema {
    type Error = CacheError;

    fn try_from(repr: SchemaRepr) -> Result<Self, Self::Error> {
        EntitySchemaBuilder {
            app_label: repr.app_label,
            name: repr.name,
            pk_field: Some(repr.pk_field),
            fields: repr.fields,
            relations: repr.relations,
            unique_together: repr.unique_together,
        }
        .build()
    }
}

/// Builder for [`EntitySchema`].
#[derive(Debug, Clone)]
pub struct EntitySchemaBuilder {
    app_label: String,
    name: String,
    pk_field: Option<String>,
    fields: Vec<FieldDef>,
    relations: Vec<RelationDef>,
    unique_together: Vec<Vec<String>>,
}

impl EntitySchemaBuilder {
    /// Declare the primary key. It is stored as the first local field.
    pub fn primary_key(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        self.fields.insert(0, FieldDef::new(name.clone(), field_type).unique());
        self.pk_field = Some(name);
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(
        mut self,
        name: impl Into<String>,
        column: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.relations.push(RelationDef {
            name: name.into(),
            column: column.into(),
            target: target.into(),
        });
        self
    }

    pub fn unique_together(mut self, fields: &[&str]) -> Self {
        self.unique_together
            .push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Validate and freeze the schema.
    pub fn build(self) -> CacheResult<EntitySchema> {
        let pk_field = self.pk_field.ok_or_else(|| ConfigError::MissingRequired {
            field: format!("{}.{} primary key", self.app_label, self.name),
        })?;

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name == PK_ALIAS {
                return Err(ConfigError::InvalidValue {
                    field: field.name.clone(),
                    value: self.name.clone(),
                    reason: format!("{PK_ALIAS} is reserved for the primary-key alias"),
                }
                .into());
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: field.name.clone(),
                    value: self.name.clone(),
                    reason: "field declared twice".to_string(),
                }
                .into());
            }
        }

        if !seen.contains(pk_field.as_str()) {
            return Err(ConfigError::MissingRequired {
                field: format!("{}.{} field {pk_field}", self.app_label, self.name),
            }
            .into());
        }

        for relation in &self.relations {
            if !seen.contains(relation.column.as_str()) {
                return Err(ConfigError::UnknownField {
                    entity: self.name.clone(),
                    field: relation.column.clone(),
                }
                .into());
            }
        }

        for group in &self.unique_together {
            if let Some(missing) = group.iter().find(|f| !seen.contains(f.as_str())) {
                return Err(ConfigError::UnknownField {
                    entity: self.name.clone(),
                    field: missing.clone(),
                }
                .into());
            }
        }

        Ok(EntitySchema {
            app_label: self.app_label,
            name: self.name,
            pk_field,
            fields: self.fields,
            relations: self.relations,
            unique_together: self.unique_together,
        })
    }
}
