//! Static sharding topology: how many partitions exist and which host owns each.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use shardstore_core::StoreError;

/// Highest partition count a map may declare.
pub const MAX_PARTITION_COUNT: u32 = 65_535;
pub const DEFAULT_PARTITION_COUNT: i64 = 16;
pub const DEFAULT_PORT: u16 = 5432;

/// Default location of the partition map inside a JSON config document.
pub const DEFAULT_SECTION_KEY: &str = "shardstore:postgresql:partitionMap";

/// Partitions served by one database host.
///
/// Numbers are read as signed integers so that negative values in a config
/// document surface as validation errors rather than parse failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionHostMap {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub partitions: Vec<i64>,
}

impl PartitionHostMap {
    pub fn new(host: impl Into<String>, port: u16, partitions: Vec<i64>) -> Self {
        Self {
            host: host.into(),
            port,
            partitions,
        }
    }

    /// Owned partitions as routing keys. Values no partition can have are
    /// skipped; a validated map has none.
    pub fn partition_numbers(&self) -> Vec<u32> {
        self.partitions
            .iter()
            .filter_map(|p| u32::try_from(*p).ok())
            .collect()
    }
}

/// Sharding topology. Read-only once validated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMap {
    #[serde(default = "default_partition_count")]
    pub partition_count: i64,
    #[serde(default)]
    pub hosts: Vec<PartitionHostMap>,
}

impl Default for PartitionMap {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            hosts: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_partition_count() -> i64 {
    DEFAULT_PARTITION_COUNT
}

/// One class of partition map violation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapViolation {
    PartitionCountOutOfRange(i64),
    NoHosts,
    WrongPartitionTotal { expected: i64, actual: usize },
    UnexpectedPartitions(Vec<i64>),
    DuplicatePartitions(Vec<i64>),
}

impl fmt::Display for MapViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartitionCountOutOfRange(n) => {
                write!(f, "partition count {n} is not in range <1, {MAX_PARTITION_COUNT}>")
            }
            Self::NoHosts => write!(f, "hosts are empty"),
            Self::WrongPartitionTotal { expected, actual } => {
                write!(f, "hosts define {actual} partitions, expected {expected}")
            }
            Self::UnexpectedPartitions(values) => {
                write!(f, "hosts define incorrect partitions: {}", join(values))
            }
            Self::DuplicatePartitions(values) => {
                write!(f, "partitions {} are defined more than once", join(values))
            }
        }
    }
}

fn join(values: &[i64]) -> String {
    values
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl PartitionMap {
    pub fn new(partition_count: i64, hosts: Vec<PartitionHostMap>) -> Self {
        Self {
            partition_count,
            hosts,
        }
    }

    /// Read the map from a config document at a colon-separated section key,
    /// e.g. `shardstore:postgresql:partitionMap`.
    pub fn from_config(config: &Value, section_key: &str) -> Result<Self, StoreError> {
        let section = config_section(config, section_key).ok_or_else(|| {
            StoreError::Configuration(format!("missing config section {section_key}"))
        })?;
        serde_json::from_value(section.clone())
            .map_err(|e| StoreError::Configuration(format!("invalid partition map: {e}")))
    }

    /// Every partition number in host order.
    pub fn flattened(&self) -> impl Iterator<Item = i64> + '_ {
        self.hosts.iter().flat_map(|h| h.partitions.iter().copied())
    }

    /// Run every applicable check and collect all violations.
    pub fn validate(&self) -> Result<(), Vec<MapViolation>> {
        let mut violations = Vec::new();

        if self.partition_count < 1 || self.partition_count > i64::from(MAX_PARTITION_COUNT) {
            violations.push(MapViolation::PartitionCountOutOfRange(self.partition_count));
        }

        if self.hosts.is_empty() {
            violations.push(MapViolation::NoHosts);
        } else {
            let defined: Vec<i64> = self.flattened().collect();

            if i64::try_from(defined.len()) != Ok(self.partition_count) {
                violations.push(MapViolation::WrongPartitionTotal {
                    expected: self.partition_count,
                    actual: defined.len(),
                });
            }

            let unexpected: BTreeSet<i64> = defined
                .iter()
                .copied()
                .filter(|p| *p < 1 || *p > self.partition_count)
                .collect();
            if !unexpected.is_empty() {
                violations.push(MapViolation::UnexpectedPartitions(
                    unexpected.into_iter().collect(),
                ));
            }

            let mut seen: BTreeMap<i64, usize> = BTreeMap::new();
            for p in &defined {
                *seen.entry(*p).or_default() += 1;
            }
            let duplicates: Vec<i64> = seen
                .into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(p, _)| p)
                .collect();
            if !duplicates.is_empty() {
                violations.push(MapViolation::DuplicatePartitions(duplicates));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// [`validate`](Self::validate), folding all violations into one configuration error.
    pub fn validate_or_err(&self) -> Result<(), StoreError> {
        self.validate().map_err(|violations| {
            let msg = violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            StoreError::Configuration(msg)
        })
    }
}

/// Walk a colon-separated key path through nested JSON objects.
pub fn config_section<'a>(config: &'a Value, section_key: &str) -> Option<&'a Value> {
    section_key
        .split(':')
        .filter(|k| !k.is_empty())
        .try_fold(config, |node, key| node.get(key))
}
