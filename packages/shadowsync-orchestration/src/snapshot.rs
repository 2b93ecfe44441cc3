//! Snapshot model and sources
//!
//! A snapshot is the full set of upstream records at one point in time,
//! keyed by primary key. Sources:
//! - [`JsonDumpSource`]: a JSON export (array of records, or
//!   `{"taken_at", "records"}`)
//! - [`JsonLinesSource`]: one record per line
//! - [`PagedSource`]: a live paginated query driven to exhaustion

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shadowsync_storage::RawEntity;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// One upstream entity as exported by the source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub pk: String,
    /// Django-style dumps call this `model`
    #[serde(rename = "type", alias = "model")]
    pub entity_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SnapshotRecord {
    pub fn new(pk: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn updated_at(mut self, ts: DateTime<Utc>) -> Self {
        self.updated_at = Some(ts);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    records: BTreeMap<String, SnapshotRecord>,
}

impl Snapshot {
    /// Build from records in source order; a repeated pk keeps the last
    /// record. UUID pks are keyed in canonical form.
    pub fn new(taken_at: DateTime<Utc>, records: impl IntoIterator<Item = SnapshotRecord>) -> Self {
        let mut by_pk = BTreeMap::new();
        for mut record in records {
            record.pk = canonical_key(&record.pk);
            let pk = record.pk.clone();
            if let Some(previous) = by_pk.insert(pk, record) {
                warn!(
                    pk = %previous.pk,
                    entity_type = %previous.entity_type,
                    "Duplicate pk in snapshot, keeping the last record"
                );
            }
        }
        Self {
            taken_at,
            records: by_pk,
        }
    }

    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            records: BTreeMap::new(),
        }
    }

    /// Last-known state reconstructed from the raw store.
    ///
    /// A single stored value reads back as a string and several as an array,
    /// which normalize to the same values that were stored.
    pub fn from_raw_entities(taken_at: DateTime<Utc>, entities: &[RawEntity]) -> Self {
        let records = entities.iter().map(|entity| {
            let fields = entity
                .fields
                .iter()
                .map(|(name, values)| {
                    let value = match values.as_slice() {
                        [single] => stored_value(single),
                        many => Value::Array(many.iter().map(stored_value).collect()),
                    };
                    (name.clone(), value)
                })
                .collect();
            SnapshotRecord {
                pk: entity.id().to_string(),
                entity_type: entity.entity_type().to_string(),
                fields,
                updated_at: None,
            }
        });
        Self::new(taken_at, records)
    }

    pub fn get(&self, pk: &str) -> Option<&SnapshotRecord> {
        self.records.get(pk)
    }

    pub fn contains(&self, pk: &str) -> bool {
        self.records.contains_key(pk)
    }

    /// Records in pk order
    pub fn records(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.records.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Keys are stored in the hyphenated lowercase UUID form.
pub(crate) fn canonical_key(key: &str) -> String {
    Uuid::parse_str(key)
        .map(|id| id.to_string())
        .unwrap_or_else(|_| key.to_string())
}

fn stored_value(value: &Option<String>) -> Value {
    match value {
        Some(v) => Value::String(v.clone()),
        None => Value::Null,
    }
}

/// Anything that can produce a full snapshot.
pub trait SnapshotSource {
    fn load(&mut self) -> Result<Snapshot>;
}

/// Dump file layout: bare array, or an envelope carrying the export time.
#[derive(Deserialize)]
#[serde(untagged)]
enum DumpFile {
    Envelope {
        taken_at: DateTime<Utc>,
        records: Vec<SnapshotRecord>,
    },
    Records(Vec<SnapshotRecord>),
}

/// JSON export file.
pub struct JsonDumpSource {
    path: PathBuf,
    taken_at: Option<DateTime<Utc>>,
}

impl JsonDumpSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            taken_at: None,
        }
    }

    /// Override the snapshot time (otherwise the envelope's `taken_at` or the
    /// file modification time).
    pub fn taken_at(mut self, ts: DateTime<Utc>) -> Self {
        self.taken_at = Some(ts);
        self
    }
}

impl SnapshotSource for JsonDumpSource {
    fn load(&mut self) -> Result<Snapshot> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            OrchestratorError::snapshot(format!("{}: {}", self.path.display(), e))
        })?;
        let dump: DumpFile = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::snapshot(format!("{}: {}", self.path.display(), e))
        })?;

        let (file_ts, records) = match dump {
            DumpFile::Envelope { taken_at, records } => (Some(taken_at), records),
            DumpFile::Records(records) => (None, records),
        };
        let taken_at = match self.taken_at.or(file_ts) {
            Some(ts) => ts,
            None => modified_time(&self.path)?,
        };

        info!(
            "Loaded dump {} ({} records, taken at {})",
            self.path.display(),
            records.len(),
            taken_at
        );
        Ok(Snapshot::new(taken_at, records))
    }
}

/// Newline-delimited JSON export; blank lines are ignored.
pub struct JsonLinesSource {
    path: PathBuf,
    taken_at: Option<DateTime<Utc>>,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            taken_at: None,
        }
    }

    pub fn taken_at(mut self, ts: DateTime<Utc>) -> Self {
        self.taken_at = Some(ts);
        self
    }
}

impl SnapshotSource for JsonLinesSource {
    fn load(&mut self) -> Result<Snapshot> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            OrchestratorError::snapshot(format!("{}: {}", self.path.display(), e))
        })?;

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SnapshotRecord = serde_json::from_str(line).map_err(|e| {
                OrchestratorError::snapshot(format!(
                    "{}:{}: {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            records.push(record);
        }

        let taken_at = match self.taken_at {
            Some(ts) => ts,
            None => modified_time(&self.path)?,
        };
        info!(
            "Loaded {} records from {}",
            records.len(),
            self.path.display()
        );
        Ok(Snapshot::new(taken_at, records))
    }
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| OrchestratorError::snapshot(format!("{}: {}", path.display(), e)))?;
    Ok(DateTime::<Utc>::from(modified))
}

/// One page of a live query.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<SnapshotRecord>,
    /// `None` on the last page
    pub next_cursor: Option<String>,
}

/// Fetches pages from the source system.
pub trait PageFetcher {
    fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page>;
}

/// Drives a [`PageFetcher`] until it reports no further page.
pub struct PagedSource<F: PageFetcher> {
    fetcher: F,
}

impl<F: PageFetcher> PagedSource<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    pub fn into_inner(self) -> F {
        self.fetcher
    }
}

impl<F: PageFetcher> SnapshotSource for PagedSource<F> {
    fn load(&mut self) -> Result<Snapshot> {
        let taken_at = Utc::now();
        let mut records = Vec::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.fetcher.fetch_page(cursor.as_deref())?;
            pages += 1;
            debug!(page = pages, records = page.records.len(), "Fetched page");
            records.extend(page.records);

            match page.next_cursor {
                Some(next) => {
                    if !seen_cursors.insert(next.clone()) {
                        return Err(OrchestratorError::snapshot(format!(
                            "Source returned cursor '{}' twice",
                            next
                        )));
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }

        info!("Fetched {} records in {} pages", records.len(), pages);
        Ok(Snapshot::new(taken_at, records))
    }
}
