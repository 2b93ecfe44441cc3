//! Snapshot diffing
//!
//! Each record is normalized exactly as it would be stored, serialized
//! canonically (field names sorted) and hashed. Fingerprints of both
//! snapshots are computed in parallel; the set algebra on pks is sequential
//! and ordered, so the result is a pure function of the two snapshots.
//!
//! - `created = keys(new) - keys(old)`
//! - `deleted = keys(old) - keys(new)`
//! - `modified = {pk in both : fingerprint or entity type differs}`, plus
//!   records inside the backtrack window
//! - `modified_important`: the subset of `modified` kept by [`ImportanceFilter`]

use chrono::Duration as ChronoDuration;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use shadowsync_storage::{normalize_fields, DiffResult, NormalizeOptions};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::{ImportanceConfig, PipelineConfig};
use crate::snapshot::{Snapshot, SnapshotRecord};

/// Content identity of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub entity_type: String,
    pub digest: [u8; 32],
}

/// Re-scan window: records updated within `days` of the new snapshot are
/// treated as modified even when their content is unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacktrackWindow {
    pub default_days: u32,
    pub overrides: BTreeMap<String, u32>,
}

impl BacktrackWindow {
    pub fn days_for(&self, entity_type: &str) -> u32 {
        self.overrides
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_days)
    }

    fn covers(&self, record: &SnapshotRecord, snapshot: &Snapshot) -> bool {
        let days = self.days_for(&record.entity_type);
        match (days, record.updated_at) {
            (0, _) | (_, None) => false,
            (days, Some(updated_at)) => {
                updated_at >= snapshot.taken_at - ChronoDuration::days(i64::from(days))
            }
        }
    }
}

/// Decides which modifications are worth invalidating derived rows for.
///
/// Evaluated in order:
/// 1. an entity whose type changed is important
/// 2. ignored types are never important
/// 3. with a participation map, types no table maps are unimportant, and
///    mapped types only count changes to fields some table reads
/// 4. watched fields: only changes to them count
/// 5. ignored fields: changes to anything else count
/// 6. otherwise important
#[derive(Debug, Clone, Default)]
pub struct ImportanceFilter {
    config: ImportanceConfig,
    /// entity type → fields read by derived tables (`None`: all fields)
    participating: Option<HashMap<String, Option<BTreeSet<String>>>>,
}

impl ImportanceFilter {
    pub fn new(config: ImportanceConfig) -> Self {
        Self {
            config,
            participating: None,
        }
    }

    pub fn with_participating_fields(
        mut self,
        participating: HashMap<String, Option<BTreeSet<String>>>,
    ) -> Self {
        self.participating = Some(participating);
        self
    }

    pub fn is_important(
        &self,
        old_type: &str,
        new_type: &str,
        changed_fields: &BTreeSet<String>,
    ) -> bool {
        if old_type != new_type {
            return true;
        }
        if self.config.ignored_types.contains(new_type) {
            return false;
        }

        if let Some(participating) = &self.participating {
            match participating.get(new_type) {
                None => return false,
                Some(Some(fields)) => {
                    if changed_fields.is_disjoint(fields) {
                        return false;
                    }
                }
                Some(None) => {}
            }
        }

        if let Some(watched) = self.config.watched_fields.get(new_type) {
            return !changed_fields.is_disjoint(watched);
        }
        if let Some(ignored) = self.config.ignored_fields.get(new_type) {
            return changed_fields.difference(ignored).next().is_some();
        }
        true
    }
}

pub struct SnapshotDiffer {
    options: NormalizeOptions,
    backtrack: BacktrackWindow,
    importance: ImportanceFilter,
}

impl SnapshotDiffer {
    pub fn new(options: NormalizeOptions, importance: ImportanceFilter) -> Self {
        Self {
            options,
            backtrack: BacktrackWindow::default(),
            importance,
        }
    }

    pub fn from_config(config: &PipelineConfig, importance: ImportanceFilter) -> Self {
        Self::new(config.normalize_options(), importance).with_backtrack(BacktrackWindow {
            default_days: config.backtrack_days,
            overrides: config.backtrack_overrides.clone(),
        })
    }

    pub fn with_backtrack(mut self, backtrack: BacktrackWindow) -> Self {
        self.backtrack = backtrack;
        self
    }

    /// Canonical fingerprint of one record's normalized fields.
    pub fn fingerprint(&self, record: &SnapshotRecord) -> Fingerprint {
        let normalized = normalize_fields(&record.fields, &self.options);
        let mut hasher = Sha256::new();
        for (name, values) in &normalized.fields {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((values.len() as u64).to_le_bytes());
            for value in values {
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Fingerprint {
            entity_type: record.entity_type.clone(),
            digest,
        }
    }

    fn fingerprints<'a>(&self, snapshot: &'a Snapshot) -> HashMap<&'a str, Fingerprint> {
        let records: Vec<&SnapshotRecord> = snapshot.records().collect();
        records
            .par_iter()
            .map(|&record| (record.pk.as_str(), self.fingerprint(record)))
            .collect()
    }

    /// Names of fields whose normalized values differ.
    pub fn changed_fields(&self, old: &SnapshotRecord, new: &SnapshotRecord) -> BTreeSet<String> {
        let old = normalize_fields(&old.fields, &self.options).fields;
        let new = normalize_fields(&new.fields, &self.options).fields;
        old.keys()
            .chain(new.keys())
            .filter(|name| old.get(*name) != new.get(*name))
            .cloned()
            .collect()
    }

    pub fn diff(&self, previous: &Snapshot, current: &Snapshot) -> DiffResult {
        let (old_prints, new_prints) =
            rayon::join(|| self.fingerprints(previous), || self.fingerprints(current));

        let mut result = DiffResult::default();
        let mut backtracked = 0usize;

        for new_record in current.records() {
            let pk = new_record.pk.as_str();
            let (Some(old_print), Some(new_print)) = (old_prints.get(pk), new_prints.get(pk))
            else {
                result.created.insert(pk.to_string());
                continue;
            };

            let changed = if old_print != new_print {
                match previous.get(pk) {
                    Some(old_record) => Some(self.changed_fields(old_record, new_record)),
                    None => None,
                }
            } else if self.backtrack.covers(new_record, current) {
                backtracked += 1;
                Some(new_record.fields.keys().cloned().collect())
            } else {
                None
            };

            if let Some(changed) = changed {
                result.modified.insert(pk.to_string());
                if self.importance.is_important(
                    &old_print.entity_type,
                    &new_print.entity_type,
                    &changed,
                ) {
                    result.modified_important.insert(pk.to_string());
                }
            }
        }

        for old_record in previous.records() {
            if !current.contains(&old_record.pk) {
                result.deleted.insert(old_record.pk.clone());
            }
        }

        debug!(
            created = result.created.len(),
            modified = result.modified.len(),
            important = result.modified_important.len(),
            deleted = result.deleted.len(),
            backtracked,
            "Snapshot diff computed"
        );
        result
    }
}
