//! Pipeline configuration
//!
//! Loaded from a versioned YAML file (`version: 1`, unknown fields rejected)
//! and overridden by CLI flags through the `with_*` builders.
//!
//! ```yaml
//! version: 1
//! batch_size: 1000
//! timezone: "UTC"
//! importance:
//!   ignored_types: [jobs.task]
//!   ignored_fields:
//!     session: [narrative]
//! ```

pub mod error;
pub mod io;

pub use error::{ConfigError, ConfigResult};
pub use io::ConfigFileV1;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use shadowsync_storage::normalize::{NormalizeOptions, DEFAULT_MAX_FIELD_BYTES};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Where snapshots come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Periodic full export files
    Dump,
    /// Paginated queries against the running source system
    Live,
}

/// Narrows `modified` down to `modified_important`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportanceConfig {
    /// Entity types whose modifications never count
    #[serde(default)]
    pub ignored_types: BTreeSet<String>,

    /// Per type: only changes to these fields count
    #[serde(default)]
    pub watched_fields: BTreeMap<String, BTreeSet<String>>,

    /// Per type: changes to these fields never count
    #[serde(default)]
    pub ignored_fields: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub mode: SourceMode,
    pub table_prefix: String,
    pub batch_size: usize,
    pub max_field_bytes: usize,
    pub timezone: String,
    pub backtrack_days: u32,
    pub backtrack_overrides: BTreeMap<String, u32>,
    pub membership_bulk_limit: usize,
    pub reservation_timeout_secs: u64,
    pub excluded_tables: BTreeSet<String>,
    pub importance: ImportanceConfig,
    pub sanitize_fields: BTreeSet<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::Dump,
            table_prefix: "shadow_".to_string(),
            batch_size: 1000,
            max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
            timezone: "UTC".to_string(),
            backtrack_days: 0,
            backtrack_overrides: BTreeMap::new(),
            membership_bulk_limit: 50_000,
            reservation_timeout_secs: 3600,
            excluded_tables: BTreeSet::new(),
            importance: ImportanceConfig::default(),
            sanitize_fields: BTreeSet::new(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a YAML configuration file
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let file: ConfigFileV1 = serde_yaml::from_str(content)?;
        Self::from_file(file)
    }

    pub fn from_file(file: ConfigFileV1) -> ConfigResult<Self> {
        match file.version {
            None => return Err(ConfigError::MissingVersion),
            Some(v) if !SUPPORTED_VERSIONS.contains(&v) => {
                return Err(ConfigError::UnsupportedVersion {
                    found: v,
                    supported: SUPPORTED_VERSIONS.to_vec(),
                })
            }
            Some(_) => {}
        }

        let defaults = Self::default();
        let config = Self {
            mode: file.mode.unwrap_or(defaults.mode),
            table_prefix: file.table_prefix.unwrap_or(defaults.table_prefix),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            max_field_bytes: file.max_field_bytes.unwrap_or(defaults.max_field_bytes),
            timezone: file.timezone.unwrap_or(defaults.timezone),
            backtrack_days: file.backtrack_days.unwrap_or(defaults.backtrack_days),
            backtrack_overrides: file
                .backtrack_overrides
                .unwrap_or(defaults.backtrack_overrides),
            membership_bulk_limit: file
                .membership_bulk_limit
                .unwrap_or(defaults.membership_bulk_limit),
            reservation_timeout_secs: file
                .reservation_timeout_secs
                .unwrap_or(defaults.reservation_timeout_secs),
            excluded_tables: file.excluded_tables.unwrap_or(defaults.excluded_tables),
            importance: file.importance.unwrap_or(defaults.importance),
            sanitize_fields: file.sanitize_fields.unwrap_or(defaults.sanitize_fields),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let file = ConfigFileV1 {
            version: Some(1),
            mode: Some(self.mode),
            table_prefix: Some(self.table_prefix.clone()),
            batch_size: Some(self.batch_size),
            max_field_bytes: Some(self.max_field_bytes),
            timezone: Some(self.timezone.clone()),
            backtrack_days: Some(self.backtrack_days),
            backtrack_overrides: Some(self.backtrack_overrides.clone()),
            membership_bulk_limit: Some(self.membership_bulk_limit),
            reservation_timeout_secs: Some(self.reservation_timeout_secs),
            excluded_tables: Some(self.excluded_tables.clone()),
            importance: Some(self.importance.clone()),
            sanitize_fields: Some(self.sanitize_fields.clone()),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::range("batch_size", 0, "Must be at least 1"));
        }
        if self.max_field_bytes == 0 {
            return Err(ConfigError::range("max_field_bytes", 0, "Must be at least 1"));
        }
        if self.membership_bulk_limit == 0 {
            return Err(ConfigError::range(
                "membership_bulk_limit",
                0,
                "Must be at least 1",
            ));
        }
        if self.table_prefix.is_empty() {
            return Err(ConfigError::range(
                "table_prefix",
                "\"\"",
                "Shadow tables need a prefix to stay apart from real tables",
            ));
        }
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::range(
                "table_prefix",
                &self.table_prefix,
                "Use letters, digits and underscores only",
            ));
        }

        parse_timezone(&self.timezone)?;

        for (entity_type, watched) in &self.importance.watched_fields {
            if let Some(ignored) = self.importance.ignored_fields.get(entity_type) {
                let overlap: Vec<&String> = watched.intersection(ignored).collect();
                if !overlap.is_empty() {
                    return Err(ConfigError::Conflict {
                        issue: format!(
                            "fields {:?} of '{}' are both watched and ignored",
                            overlap, entity_type
                        ),
                        fix: "Remove them from one of the two lists".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Fixed offset used for job dates. Validated on load.
    pub fn offset(&self) -> ConfigResult<FixedOffset> {
        parse_timezone(&self.timezone)
    }

    pub fn backtrack_days_for(&self, entity_type: &str) -> u32 {
        self.backtrack_overrides
            .get(entity_type)
            .copied()
            .unwrap_or(self.backtrack_days)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            max_field_bytes: self.max_field_bytes,
            sanitize_fields: self.sanitize_fields.iter().cloned().collect(),
        }
    }

    pub fn is_excluded(&self, table: &str) -> bool {
        self.excluded_tables.contains(table)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_backtrack_days(mut self, days: u32) -> Self {
        self.backtrack_days = days;
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_membership_bulk_limit(mut self, limit: usize) -> Self {
        self.membership_bulk_limit = limit;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn exclude_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_tables.extend(tables.into_iter().map(Into::into));
        self
    }

    pub fn with_importance(mut self, importance: ImportanceConfig) -> Self {
        self.importance = importance;
        self
    }
}

/// `UTC`, `Z`, or a `+HH:MM` / `-HH:MM` offset.
pub fn parse_timezone(value: &str) -> ConfigResult<FixedOffset> {
    let invalid = || ConfigError::InvalidTimezone(value.to_string());

    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match value.chars().next() {
        Some('+') => (1, &value[1..]),
        Some('-') => (-1, &value[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    if hours.len() != 2 || minutes.len() != 2 {
        return Err(invalid());
    }
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
