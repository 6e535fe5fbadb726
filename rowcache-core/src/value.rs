//! Scalar field values and their declared types.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

/// Declared type of a locally stored field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Integer,
    Float,
    Text,
    Uuid,
    Timestamp,
    Json,
    /// File-like field. Only the reference name is held, never the content.
    File,
}

/// A single scalar value held by a row.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(Json),
    File(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The declared type this value satisfies, `None` for `Null`.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(FieldType::Bool),
            Self::Int(_) => Some(FieldType::Integer),
            Self::Float(_) => Some(FieldType::Float),
            Self::Text(_) => Some(FieldType::Text),
            Self::Uuid(_) => Some(FieldType::Uuid),
            Self::Timestamp(_) => Some(FieldType::Timestamp),
            Self::Json(_) => Some(FieldType::Json),
            Self::File(_) => Some(FieldType::File),
        }
    }

    /// Stringified form used for cache key derivation.
    ///
    /// Values of different types with the same textual form (`Int(1)` and
    /// `Text("1")`) produce the same text.
    pub fn key_text(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) | Self::File(s) => s.clone(),
            Self::Uuid(u) => u.hyphenated().to_string(),
            Self::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Self::Json(v) => v.to_string(),
        }
    }

    /// JSON-safe representation for cached payloads.
    ///
    /// Returns `None` for floats JSON cannot represent (NaN, infinities).
    pub fn to_json(&self) -> Option<Json> {
        Some(match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => Json::Number(serde_json::Number::from_f64(*f)?),
            Self::Text(s) | Self::File(s) => Json::String(s.clone()),
            Self::Uuid(u) => Json::String(u.hyphenated().to_string()),
            Self::Timestamp(ts) => Json::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::Json(v) => v.clone(),
        })
    }

    /// Convert a payload value back into a value of the declared type.
    ///
    /// JSON `null` always converts to `Null`; nullability is the caller's
    /// concern. Returns `None` when the value cannot represent `field_type`.
    pub fn from_json(field_type: FieldType, value: &Json) -> Option<Self> {
        if value.is_null() {
            return Some(Self::Null);
        }
        match field_type {
            FieldType::Bool => value.as_bool().map(Self::Bool),
            FieldType::Integer => match value {
                Json::Number(n) => n.as_i64().map(Self::Int),
                Json::String(s) => s.parse().ok().map(Self::Int),
                _ => None,
            },
            FieldType::Float => match value {
                Json::Number(n) => n.as_f64().map(Self::Float),
                Json::String(s) => s.parse().ok().map(Self::Float),
                _ => None,
            },
            FieldType::Text => value.as_str().map(|s| Self::Text(s.to_string())),
            FieldType::Uuid => value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(Self::Uuid),
            FieldType::Timestamp => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| Self::Timestamp(ts.with_timezone(&Utc))),
            FieldType::Json => Some(Self::Json(value.clone())),
            FieldType::File => value.as_str().map(|s| Self::File(s.to_string())),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::File(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{:?}", s),
            other => f.write_str(&other.key_text()),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
