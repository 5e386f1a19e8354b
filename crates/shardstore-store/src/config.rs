//! Store configuration with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`StoreConfig::default()`]
//! 2. If a JSON file is given, deep-merge its section (default
//!    `shardstore:postgresql`) over the defaults
//! 3. Apply `SHARDSTORE_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use shardstore_core::StoreError;
use shardstore_routing::{config_section, PartitionMap};

use crate::connection::ConnectionParams;
use crate::schema::validate_identifier;

pub const DEFAULT_SECTION: &str = "shardstore:postgresql";
pub const DEFAULT_SCHEMA: &str = "es";
pub const DEFAULT_CONNECTION_STRING: &str =
    "Host=localhost;Port=5432;Database=postgres;Username=postgres";

pub const ENV_CONNECTION_STRING: &str = "SHARDSTORE_CONNECTION_STRING";
pub const ENV_SCHEMA: &str = "SHARDSTORE_SCHEMA";
pub const ENV_SHARDING: &str = "SHARDSTORE_SHARDING";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Template connection string; `%NAME%` references expand from the environment.
    pub connection_string: String,
    pub schema: String,
    /// Route streams across the hosts of `partition_map` instead of one host.
    pub sharding: bool,
    pub partition_map: PartitionMap,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: DEFAULT_CONNECTION_STRING.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            sharding: false,
            partition_map: PartitionMap::default(),
        }
    }
}

impl StoreConfig {
    /// Merge the section at `section_key` of a config document over the defaults.
    /// A missing section yields the defaults.
    pub fn from_document(document: &Value, section_key: &str) -> Result<Self, StoreError> {
        let defaults = serde_json::to_value(Self::default())
            .map_err(|e| StoreError::Configuration(e.to_string()))?;
        let merged = match config_section(document, section_key) {
            Some(section) => deep_merge(defaults, section.clone()),
            None => {
                debug!(section_key, "config section not found, using defaults");
                defaults
            }
        };
        serde_json::from_value(merged)
            .map_err(|e| StoreError::Configuration(format!("invalid store config: {e}")))
    }

    pub fn from_json_str(json: &str, section_key: &str) -> Result<Self, StoreError> {
        let document: Value = serde_json::from_str(json)
            .map_err(|e| StoreError::Configuration(format!("invalid JSON: {e}")))?;
        Self::from_document(&document, section_key)
    }

    /// Apply overrides from a key lookup (the environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(v) = read(ENV_CONNECTION_STRING) {
            self.connection_string = v;
        }
        if let Some(v) = read(ENV_SCHEMA) {
            self.schema = v;
        }
        if let Some(v) = read(ENV_SHARDING) {
            match parse_bool(&v) {
                Some(b) => self.sharding = b,
                None => warn!(key = ENV_SHARDING, value = %v, "invalid boolean env var, ignoring"),
            }
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Schema name, connection string and, when sharding, the partition map.
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_identifier(&self.schema)?;
        let _ = ConnectionParams::parse(&self.connection_string)?;
        if self.sharding {
            self.partition_map.validate_or_err()?;
        }
        Ok(())
    }
}

/// Load from a file (defaults if it does not exist) plus environment overrides.
pub fn load_config_from_path(path: &Path, section_key: &str) -> Result<StoreConfig, StoreError> {
    let mut config = if path.exists() {
        debug!(?path, "loading store config from file");
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Configuration(format!("read {}: {e}", path.display())))?;
        StoreConfig::from_json_str(&content, section_key)?
    } else {
        debug!(?path, "config file not found, using defaults");
        StoreConfig::default()
    };
    config.apply_env_overrides();
    Ok(config)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
