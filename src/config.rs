// src/config.rs

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, path::Path};

/// Published schema generation. Each generation has its own key column name and
/// its own output folder under the publish root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    V2,
    V3,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &str {
        match self {
            SchemaVersion::V2 => "v2",
            SchemaVersion::V3 => "v3",
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            SchemaVersion::V2 => "key",
            SchemaVersion::V3 => "location_key",
        }
    }
}

/// Declared semantic type of a column, used to coerce values in the JSON mirror.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
}

/// What a fan-out stage does when one of its tasks fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// The first failing task aborts the whole stage.
    #[default]
    FailFast,
    /// Failures are collected into the stage report and the stage carries on.
    Isolate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workers {
    pub latest: usize,
    pub aggregate: usize,
    /// Defaults to 2, mirroring is mostly disk bound.
    pub mirror: usize,
}

impl Default for Workers {
    fn default() -> Self {
        Self {
            latest: num_cpus::get(),
            aggregate: num_cpus::get(),
            mirror: 2,
        }
    }
}

/// Internal → published column names. A `None` target drops the column.
static DEFAULT_COLUMN_ADAPTER: Lazy<BTreeMap<String, Option<String>>> = Lazy::new(|| {
    [
        ("key", "location_key"),
        ("total_confirmed", "cumulative_confirmed"),
        ("total_deceased", "cumulative_deceased"),
        ("total_recovered", "cumulative_recovered"),
        ("total_tested", "cumulative_tested"),
        ("total_hospitalized", "cumulative_hospitalized"),
        ("total_intensive_care", "cumulative_intensive_care"),
        ("total_ventilator", "cumulative_ventilator"),
    ]
    .into_iter()
    .map(|(from, to)| (from.to_string(), Some(to.to_string())))
    .collect()
});

static DEFAULT_COLUMN_TYPES: Lazy<BTreeMap<String, ColumnType>> = Lazy::new(|| {
    let mut types: BTreeMap<String, ColumnType> = [
        ("key", ColumnType::String),
        ("location_key", ColumnType::String),
        ("date", ColumnType::String),
        ("population", ColumnType::Integer),
        ("latitude", ColumnType::Float),
        ("longitude", ColumnType::Float),
        ("area_sq_km", ColumnType::Float),
    ]
    .into_iter()
    .map(|(name, ty)| (name.to_string(), ty))
    .collect();

    for metric in [
        "confirmed",
        "deceased",
        "recovered",
        "tested",
        "hospitalized",
        "intensive_care",
        "ventilator",
    ] {
        for prefix in ["new", "total", "cumulative"] {
            types.insert(format!("{prefix}_{metric}"), ColumnType::Integer);
        }
    }
    types
});

/// Static configuration of a publish run. Every field has a built-in default so a
/// config file only needs to carry overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub column_adapter: BTreeMap<String, Option<String>>,
    /// Tables withheld from every main-table join.
    pub exclude_from_main_table: Vec<String>,
    pub column_types: BTreeMap<String, ColumnType>,
    pub workers: Workers,
    pub aggregate_failures: FailurePolicy,
    /// Rows held in memory per run of the external sort.
    pub sort_chunk_rows: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            column_adapter: DEFAULT_COLUMN_ADAPTER.clone(),
            exclude_from_main_table: vec!["main".to_string()],
            column_types: DEFAULT_COLUMN_TYPES.clone(),
            workers: Workers::default(),
            aggregate_failures: FailurePolicy::FailFast,
            sort_chunk_rows: 1_000_000,
        }
    }
}

impl PublishConfig {
    /// Load overrides from a YAML file, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = File::open(path)
            .with_context(|| format!("opening config file {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn column_type(&self, column: &str) -> ColumnType {
        self.column_types
            .get(column)
            .copied()
            .unwrap_or(ColumnType::String)
    }
}
