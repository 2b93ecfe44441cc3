//! Configuration I/O (YAML loading)
//!
//! Defines the YAML schema. Every setting is optional in the file and falls
//! back to [`PipelineConfig::default`]; conversion lives in `mod.rs`.
//!
//! [`PipelineConfig::default`]: super::PipelineConfig

use super::{ImportanceConfig, SourceMode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// YAML Schema v1
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileV1 {
    /// Schema version (always 1 for v1)
    #[serde(default)]
    pub version: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SourceMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_field_bytes: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrack_days: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrack_overrides: Option<BTreeMap<String, u32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_bulk_limit: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_tables: Option<BTreeSet<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<ImportanceConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitize_fields: Option<BTreeSet<String>>,
}
