//! Audit records: per-run diff, per-stage timing, row reservations.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Primary-key sets produced by one snapshot comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub created: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    /// Subset of `modified` relevant to at least one derived table
    pub modified_important: BTreeSet<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Keys whose derived rows must be invalidated.
    pub fn invalidated(&self) -> BTreeSet<String> {
        self.deleted
            .union(&self.modified_important)
            .cloned()
            .collect()
    }

    /// Modified keys whose derived rows can stay.
    pub fn modified_unimportant(&self) -> BTreeSet<String> {
        self.modified
            .difference(&self.modified_important)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "+{} ~{} (important {}) -{}",
            self.created.len(),
            self.modified.len(),
            self.modified_important.len(),
            self.deleted.len()
        )
    }
}

/// One recorded pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    pub job_id: i64,
    pub job_date: NaiveDate,
    pub timezone: String,
    pub current_snapshot_ts: DateTime<Utc>,
    pub previous_snapshot_ts: Option<DateTime<Utc>>,
    pub diff: DiffResult,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a job; `job_id` and `created_at` come from the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_date: NaiveDate,
    pub timezone: String,
    pub current_snapshot_ts: DateTime<Utc>,
    pub previous_snapshot_ts: Option<DateTime<Utc>>,
    pub diff: DiffResult,
}

/// Timing of one completed stage of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub job_id: i64,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
}

impl TaskStatus {
    pub fn new(
        job_id: i64,
        task_name: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            task_name: task_name.into(),
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Error,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(ReservationStatus::Reserved),
            "error" => Some(ReservationStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A claim on one row of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub table_name: String,
    pub key: String,
    pub worker_id: String,
    pub reserved_at: DateTime<Utc>,
    pub status: ReservationStatus,
    pub message: Option<String>,
}

/// Result of trying to reserve a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Caller now owns the row
    Acquired,
    /// Another worker holds a live reservation
    HeldByOther { worker_id: String },
    /// A previous attempt failed permanently
    Errored { message: Option<String> },
}

impl ReserveOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, ReserveOutcome::Acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_invalidated_is_deleted_plus_important() {
        let diff = DiffResult {
            created: set(&["c"]),
            modified: set(&["m1", "m2"]),
            deleted: set(&["d"]),
            modified_important: set(&["m1"]),
        };
        assert_eq!(diff.invalidated(), set(&["d", "m1"]));
        assert_eq!(diff.modified_unimportant(), set(&["m2"]));
        assert!(!diff.is_empty());
        assert_eq!(diff.summary(), "+1 ~2 (important 1) -1");
    }

    #[test]
    fn test_task_duration() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(1500);
        let task = TaskStatus::new(1, "ingest-raw", start, end);
        assert_eq!(task.duration_ms, 1500);
    }

    #[test]
    fn test_reservation_status_roundtrip() {
        for status in [ReservationStatus::Reserved, ReservationStatus::Error] {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("weird"), None);
    }
}
