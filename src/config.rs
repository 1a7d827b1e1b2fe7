//! Category catalog and runtime settings.
//!
//! The catalog is a YAML document listing every data category the pipeline
//! accepts: its canonical headers, alias rules, header offsets and destination
//! table. Settings come from `MARKETLOAD_*` environment variables.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

pub const DEFAULT_DATASET: &str = "imports";

const SNAPSHOT_MARKERS: &[&str] = &["BA Produk", "Informasi", "Export SKU", "Demografis", "Proyeksi"];
const DYNAMIC_HEADER_MARKERS: &[&str] = &["BA Produk", "Informasi Media"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value '{value}' for {key}")]
    InvalidSetting { key: String, value: String },
    #[error("category '{name}' is invalid: {reason}")]
    InvalidCategory { name: String, reason: String },
    #[error("unknown category '{0}'")]
    UnknownCategory(String),
}

/// Whether an import replaces a brand's rows or accumulates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Snapshot,
    Append,
}

impl LoadMode {
    /// Classification used when the catalog does not say.
    pub fn for_category_name(name: &str) -> Self {
        if SNAPSHOT_MARKERS.iter().any(|marker| name.contains(marker)) {
            LoadMode::Snapshot
        } else {
            LoadMode::Append
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Snapshot => write!(f, "snapshot"),
            LoadMode::Append => write!(f, "append"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCategory {
    name: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    load_mode: Option<LoadMode>,
    #[serde(default)]
    dynamic_headers: Option<bool>,
    #[serde(default)]
    header_row: usize,
    #[serde(default)]
    data_start_row: Option<usize>,
    #[serde(default)]
    required_headers: Vec<String>,
    #[serde(default)]
    column_aliases: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCatalog {
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    categories: Vec<RawCategory>,
}

/// Immutable descriptor of one data category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryConfig {
    pub name: String,
    pub table: String,
    pub load_mode: LoadMode,
    pub dynamic_headers: bool,
    /// 0-based row holding the header.
    pub header_row: usize,
    /// 0-based row of the first data record.
    pub data_start_row: usize,
    pub required_headers: Vec<String>,
    pub column_aliases: BTreeMap<String, Vec<String>>,
}

impl CategoryConfig {
    /// A category with name-derived defaults and no alias rules.
    pub fn new(name: &str, required_headers: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            table: default_table_name(name),
            load_mode: LoadMode::for_category_name(name),
            dynamic_headers: DYNAMIC_HEADER_MARKERS.iter().any(|m| name.contains(m)),
            header_row: 0,
            data_start_row: 1,
            required_headers,
            column_aliases: BTreeMap::new(),
        }
    }

    pub fn with_aliases(mut self, header: &str, aliases: &[&str]) -> Self {
        self.column_aliases.insert(
            header.to_string(),
            aliases.iter().map(|a| a.to_string()).collect(),
        );
        self
    }

    pub fn with_load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }

    pub fn with_dynamic_headers(mut self, enabled: bool) -> Self {
        self.dynamic_headers = enabled;
        self
    }

    pub fn with_offsets(mut self, header_row: usize, data_start_row: usize) -> Self {
        self.header_row = header_row;
        self.data_start_row = data_start_row;
        self
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    fn from_raw(raw: RawCategory) -> Result<Self, ConfigError> {
        let mut category = CategoryConfig::new(raw.name.trim(), raw.required_headers);
        if category.name.is_empty() {
            return Err(ConfigError::InvalidCategory {
                name: raw.name,
                reason: "name is empty".to_string(),
            });
        }
        if let Some(table) = raw.table {
            category.table = table.trim().to_string();
        }
        if let Some(mode) = raw.load_mode {
            category.load_mode = mode;
        }
        if let Some(dynamic) = raw.dynamic_headers {
            category.dynamic_headers = dynamic;
        }
        category.header_row = raw.header_row;
        category.data_start_row = raw.data_start_row.unwrap_or(raw.header_row + 1);
        category.column_aliases = raw.column_aliases;
        category.validate()?;
        Ok(category)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCategory {
            name: self.name.clone(),
            reason,
        };
        if self.table.is_empty() {
            return Err(invalid("table name is empty".to_string()));
        }
        if !self
            .table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(format!(
                "table name '{}' may only contain letters, digits, '_' and '-'",
                self.table
            )));
        }
        if self.data_start_row <= self.header_row {
            return Err(invalid(format!(
                "data_start_row ({}) must be greater than header_row ({})",
                self.data_start_row, self.header_row
            )));
        }
        Ok(())
    }
}

/// Lower-cased category name with runs of non-alphanumerics folded to `_`.
pub fn default_table_name(name: &str) -> String {
    let mut table = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            table.push(ch.to_ascii_lowercase());
        } else if !table.ends_with('_') {
            table.push('_');
        }
    }
    table.trim_matches('_').to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Catalog {
    pub dataset: Option<String>,
    pub categories: Vec<CategoryConfig>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawCatalog = serde_yaml::from_reader(BufReader::new(file))?;
        Self::from_raw(raw)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawCatalog = serde_yaml::from_str(input)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawCatalog) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut categories = Vec::with_capacity(raw.categories.len());
        for raw_category in raw.categories {
            let category = CategoryConfig::from_raw(raw_category)?;
            if !seen.insert(category.name.to_lowercase()) {
                return Err(ConfigError::InvalidCategory {
                    name: category.name,
                    reason: "duplicate category name".to_string(),
                });
            }
            categories.push(category);
        }
        Ok(Self {
            dataset: raw.dataset.filter(|d| !d.trim().is_empty()),
            categories,
        })
    }

    /// Exact name first, then case-insensitive.
    pub fn find(&self, name: &str) -> Result<&CategoryConfig, ConfigError> {
        let name = name.trim();
        self.categories
            .iter()
            .find(|c| c.name == name)
            .or_else(|| {
                self.categories
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
            })
            .ok_or_else(|| ConfigError::UnknownCategory(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub dataset: String,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub table_settle: Duration,
    pub final_lookup_wait: Duration,
    pub append_dedup: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dataset: DEFAULT_DATASET.to_string(),
            batch_size: 500,
            max_retries: 5,
            retry_base: Duration::from_millis(1000),
            retry_max: Duration::from_millis(30_000),
            table_settle: Duration::from_millis(8000),
            final_lookup_wait: Duration::from_millis(3000),
            append_dedup: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        if let Some(dataset) = lookup("MARKETLOAD_DATASET").filter(|d| !d.trim().is_empty()) {
            settings.dataset = dataset.trim().to_string();
        }
        if let Some(size) = parse_setting::<usize>(&lookup, "MARKETLOAD_BATCH_SIZE")? {
            if size == 0 {
                return Err(ConfigError::InvalidSetting {
                    key: "MARKETLOAD_BATCH_SIZE".to_string(),
                    value: "0".to_string(),
                });
            }
            settings.batch_size = size;
        }
        if let Some(retries) = parse_setting(&lookup, "MARKETLOAD_MAX_RETRIES")? {
            settings.max_retries = retries;
        }
        if let Some(ms) = parse_setting(&lookup, "MARKETLOAD_RETRY_BASE_MS")? {
            settings.retry_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_setting(&lookup, "MARKETLOAD_RETRY_MAX_MS")? {
            settings.retry_max = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_setting(&lookup, "MARKETLOAD_TABLE_SETTLE_MS")? {
            settings.table_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_setting(&lookup, "MARKETLOAD_FINAL_LOOKUP_WAIT_MS")? {
            settings.final_lookup_wait = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("MARKETLOAD_APPEND_DEDUP") {
            settings.append_dedup = parse_flag("MARKETLOAD_APPEND_DEDUP", &raw)?;
        }
        Ok(settings)
    }

    /// Settings that never sleep; used by tests and dry runs.
    pub fn without_delays() -> Self {
        Self {
            retry_base: Duration::ZERO,
            retry_max: Duration::ZERO,
            table_settle: Duration::ZERO,
            final_lookup_wait: Duration::ZERO,
            ..Settings::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base, self.retry_max)
    }
}

fn parse_setting<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidSetting {
            key: key.to_string(),
            value: raw,
        })
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidSetting {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}
