//! Cached payload encoding.
//!
//! A payload is a JSON object mapping every locally declared field to its
//! JSON-safe value. Decoding is driven by the *current* schema: extra keys
//! left by an older schema are ignored, while a missing or unconvertible
//! field rejects the whole payload. Callers treat any decode error as a
//! cache miss.

use rowcache_core::{CodecError, EntitySchema, FieldValue, Row};
use serde_json::{Map, Value as Json};

/// Encode every declared field of `row`.
pub fn encode(schema: &EntitySchema, row: &Row) -> Result<String, CodecError> {
    let mut object = Map::new();
    for field in schema.fields() {
        let value = row.value(&field.name);
        let json = value.to_json().ok_or_else(|| CodecError::Unencodable {
            entity: schema.name().to_string(),
            field: field.name.clone(),
            reason: format!("{value} has no JSON representation"),
        })?;
        object.insert(field.name.clone(), json);
    }

    serde_json::to_string(&Json::Object(object)).map_err(|e| CodecError::Unencodable {
        entity: schema.name().to_string(),
        field: String::new(),
        reason: e.to_string(),
    })
}

/// Rebuild a row of `schema` from `payload`.
pub fn decode(schema: &EntitySchema, payload: &str) -> Result<Row, CodecError> {
    let malformed = |reason: String| CodecError::Malformed {
        entity: schema.name().to_string(),
        reason,
    };
    let incompatible = |reason: String| CodecError::Incompatible {
        entity: schema.name().to_string(),
        reason,
    };

    let parsed: Json = serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?;
    let Json::Object(object) = parsed else {
        return Err(malformed("payload is not a JSON object".to_string()));
    };

    let mut row = Row::new(schema.name());
    for field in schema.fields() {
        let raw = object
            .get(&field.name)
            .ok_or_else(|| incompatible(format!("missing field {}", field.name)))?;

        let value = FieldValue::from_json(field.field_type, raw).ok_or_else(|| {
            incompatible(format!(
                "{} is not a valid {:?} value",
                field.name, field.field_type
            ))
        })?;

        if value.is_null() && !field.nullable {
            return Err(incompatible(format!("{} may not be null", field.name)));
        }
        row.set(field.name.clone(), value);
    }

    Ok(row)
}
