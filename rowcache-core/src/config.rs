//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheResult, ConfigError};
use crate::schema::{EntitySchema, PK_ALIAS};

/// Name of the backend used when none is configured.
pub const DEFAULT_BACKEND: &str = "default";

const ENV_MODEL_TIMEOUT_SECS: &str = "ROWCACHE_MODEL_TIMEOUT_SECS";
const ENV_DEFAULT_BACKEND: &str = "ROWCACHE_DEFAULT_BACKEND";
const ENV_LMDB_PATH: &str = "ROWCACHE_LMDB_PATH";
const ENV_LMDB_MAX_SIZE_MB: &str = "ROWCACHE_LMDB_MAX_SIZE_MB";

/// Process-wide cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// TTL applied to cached payloads when a controller sets none.
    /// `None` stores entries without expiry.
    pub default_timeout: Option<Duration>,
    pub default_backend: String,
    /// Directory of the LMDB environment, when the persistent backend is used.
    pub lmdb_path: Option<PathBuf>,
    pub lmdb_max_size_mb: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_timeout: None,
            default_backend: DEFAULT_BACKEND.to_string(),
            lmdb_path: None,
            lmdb_max_size_mb: 1024,
        }
    }
}

impl CacheSettings {
    /// Load settings from `ROWCACHE_*` environment variables.
    ///
    /// Unset variables keep their default. Set but unparseable values are an
    /// error rather than silently ignored.
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`CacheSettings::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(raw) = lookup(ENV_MODEL_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: ENV_MODEL_TIMEOUT_SECS.to_string(),
                value: raw.clone(),
                reason: "expected a whole number of seconds".to_string(),
            })?;
            // 0 means "no expiry"
            settings.default_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(raw) = lookup(ENV_DEFAULT_BACKEND) {
            settings.default_backend = raw.trim().to_string();
        }

        if let Some(raw) = lookup(ENV_LMDB_PATH) {
            settings.lmdb_path = Some(PathBuf::from(raw));
        }

        if let Some(raw) = lookup(ENV_LMDB_MAX_SIZE_MB) {
            settings.lmdb_max_size_mb =
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: ENV_LMDB_MAX_SIZE_MB.to_string(),
                    value: raw.clone(),
                    reason: "expected a size in megabytes".to_string(),
                })?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> CacheResult<()> {
        if self.default_backend.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "default_backend".to_string(),
                value: String::new(),
                reason: "default_backend must not be empty".to_string(),
            }
            .into());
        }

        if self.default_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidValue {
                field: "default_timeout".to_string(),
                value: "0s".to_string(),
                reason: "use None for entries without expiry".to_string(),
            }
            .into());
        }

        if self.lmdb_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_max_size_mb".to_string(),
                value: "0".to_string(),
                reason: "lmdb_max_size_mb must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// One member of an entity's key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Field(String),
    Tuple(Vec<String>),
}

impl KeySpec {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Field(f) => vec![f.as_str()],
            Self::Tuple(fs) => fs.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for KeySpec {
    fn from(field: &str) -> Self {
        Self::Field(field.to_string())
    }
}

impl<const N: usize> From<[&str; N]> for KeySpec {
    fn from(fields: [&str; N]) -> Self {
        Self::Tuple(fields.iter().map(|f| f.to_string()).collect())
    }
}

/// The field combinations an entity is cached under.
///
/// The primary key is always a member and is listed first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    specs: Vec<KeySpec>,
}

impl KeySet {
    /// Build and validate a key set against `schema`.
    pub fn new(schema: &EntitySchema, declared: &[KeySpec]) -> CacheResult<Self> {
        let mut specs = vec![KeySpec::Field(PK_ALIAS.to_string())];

        for spec in declared {
            if let KeySpec::Tuple(fields) = spec {
                if fields.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "fields".to_string(),
                        value: "()".to_string(),
                        reason: "a key tuple needs at least one field".to_string(),
                    }
                    .into());
                }
            }
            for field in spec.fields() {
                if !schema.has_field(field) {
                    return Err(ConfigError::UnknownField {
                        entity: schema.name().to_string(),
                        field: field.to_string(),
                    }
                    .into());
                }
            }

            let normalized = normalize(schema, spec);
            if !specs.contains(&normalized) {
                specs.push(normalized);
            }
        }

        Ok(Self { specs })
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeySpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

// Raw pk name becomes the alias; a one-element tuple is just a field.
fn normalize(schema: &EntitySchema, spec: &KeySpec) -> KeySpec {
    let alias = |f: &str| {
        if f == schema.pk_field() {
            PK_ALIAS.to_string()
        } else {
            f.to_string()
        }
    };
    match spec {
        KeySpec::Field(f) => KeySpec::Field(alias(f)),
        KeySpec::Tuple(fs) if fs.len() == 1 => KeySpec::Field(alias(&fs[0])),
        KeySpec::Tuple(fs) => KeySpec::Tuple(fs.iter().map(|f| alias(f)).collect()),
    }
}

/// Per-entity cache options, resolved at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOptions {
    pub fields: Vec<KeySpec>,
    pub related_fields: Vec<String>,
    pub backend: String,
    pub timeout: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

impl CacheOptions {
    /// Options inheriting the backend and timeout from `settings`.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            fields: Vec::new(),
            related_fields: Vec::new(),
            backend: settings.default_backend.clone(),
            timeout: settings.default_timeout,
        }
    }

    /// Add a key-set member: a field name or an array of field names.
    pub fn key(mut self, spec: impl Into<KeySpec>) -> Self {
        self.fields.push(spec.into());
        self
    }

    pub fn related(mut self, relation: impl Into<String>) -> Self {
        self.related_fields.push(relation.into());
        self
    }

    pub fn backend(mut self, name: impl Into<String>) -> Self {
        self.backend = name.into();
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================
