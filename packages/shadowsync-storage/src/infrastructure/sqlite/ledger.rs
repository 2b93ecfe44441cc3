//! Job and task persistence.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row as SqlRow};
use std::collections::BTreeSet;

use super::SqliteStore;
use crate::domain::{DiffResult, JobEntry, LedgerStore, NewJob, TaskStatus};
use crate::Result;

const JOB_COLUMNS: &str = "job_id, job_date, timezone, current_snapshot_ts, previous_snapshot_ts,
     created_pks, modified_pks, deleted_pks, modified_pks_important, created_at";

/// Row shape before the key-set columns are decoded
struct JobRow {
    job_id: i64,
    job_date: NaiveDate,
    timezone: String,
    current_snapshot_ts: DateTime<Utc>,
    previous_snapshot_ts: Option<DateTime<Utc>>,
    created: String,
    modified: String,
    deleted: String,
    modified_important: String,
    created_at: DateTime<Utc>,
}

impl JobRow {
    fn from_row(row: &SqlRow<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            job_date: row.get(1)?,
            timezone: row.get(2)?,
            current_snapshot_ts: row.get(3)?,
            previous_snapshot_ts: row.get(4)?,
            created: row.get(5)?,
            modified: row.get(6)?,
            deleted: row.get(7)?,
            modified_important: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<JobEntry> {
        Ok(JobEntry {
            job_id: self.job_id,
            job_date: self.job_date,
            timezone: self.timezone,
            current_snapshot_ts: self.current_snapshot_ts,
            previous_snapshot_ts: self.previous_snapshot_ts,
            diff: DiffResult {
                created: decode_keys(&self.created)?,
                modified: decode_keys(&self.modified)?,
                deleted: decode_keys(&self.deleted)?,
                modified_important: decode_keys(&self.modified_important)?,
            },
            created_at: self.created_at,
        })
    }
}

fn encode_keys(keys: &BTreeSet<String>) -> Result<String> {
    Ok(serde_json::to_string(keys)?)
}

fn decode_keys(json: &str) -> Result<BTreeSet<String>> {
    Ok(serde_json::from_str(json)?)
}

impl LedgerStore for SqliteStore {
    fn insert_job_if_absent(&self, job: &NewJob) -> Result<(JobEntry, bool)> {
        let created = encode_keys(&job.diff.created)?;
        let modified = encode_keys(&job.diff.modified)?;
        let deleted = encode_keys(&job.diff.deleted)?;
        let important = encode_keys(&job.diff.modified_important)?;

        let (row, inserted) = self.with_immediate_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO jobs (
                    job_date, timezone, current_snapshot_ts, previous_snapshot_ts,
                    created_pks, modified_pks, deleted_pks, modified_pks_important, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.job_date,
                    job.timezone,
                    job.current_snapshot_ts,
                    job.previous_snapshot_ts,
                    created,
                    modified,
                    deleted,
                    important,
                    Utc::now()
                ],
            )?;
            let row = tx.query_row(
                &format!(
                    "SELECT {} FROM jobs WHERE job_date = ?1 AND timezone = ?2",
                    JOB_COLUMNS
                ),
                params![job.job_date, job.timezone],
                JobRow::from_row,
            )?;
            Ok((row, inserted > 0))
        })?;

        Ok((row.into_entry()?, inserted))
    }

    fn find_job(&self, job_date: NaiveDate, timezone: &str) -> Result<Option<JobEntry>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM jobs WHERE job_date = ?1 AND timezone = ?2",
                        JOB_COLUMNS
                    ),
                    params![job_date, timezone],
                    JobRow::from_row,
                )
                .optional()?)
        })?;
        row.map(JobRow::into_entry).transpose()
    }

    fn latest_job(&self) -> Result<Option<JobEntry>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM jobs ORDER BY current_snapshot_ts DESC, job_id DESC LIMIT 1",
                        JOB_COLUMNS
                    ),
                    [],
                    JobRow::from_row,
                )
                .optional()?)
        })?;
        row.map(JobRow::into_entry).transpose()
    }

    fn record_task(&self, task: &TaskStatus) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO task_status
                    (job_id, task_name, start_time, end_time, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task.job_id,
                    task.task_name,
                    task.start_time,
                    task.end_time,
                    task.duration_ms
                ],
            )?;
            Ok(n > 0)
        })
    }

    fn was_deleted(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS (
                    SELECT 1 FROM jobs j, json_each(j.deleted_pks) k WHERE k.value = ?1
                 )",
                [key],
                |row| row.get(0),
            )?)
        })
    }

    fn tasks_for_job(&self, job_id: i64) -> Result<Vec<TaskStatus>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT job_id, task_name, start_time, end_time, duration_ms
                 FROM task_status WHERE job_id = ?1 ORDER BY start_time, task_name",
            )?;
            let tasks = stmt
                .query_map([job_id], |row| {
                    Ok(TaskStatus {
                        job_id: row.get(0)?,
                        task_name: row.get(1)?,
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                        duration_ms: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_job(day: u32, created: &[&str]) -> NewJob {
        let ts = Utc.with_ymd_and_hms(2024, 3, day, 6, 0, 0).unwrap();
        NewJob {
            job_date: ts.date_naive(),
            timezone: "UTC".to_string(),
            current_snapshot_ts: ts,
            previous_snapshot_ts: None,
            diff: DiffResult {
                created: created.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_job_is_idempotent_per_date() {
        let store = SqliteStore::in_memory().unwrap();
        let (first, inserted) = store.insert_job_if_absent(&new_job(1, &["a", "b"])).unwrap();
        assert!(inserted);
        assert_eq!(first.diff.created.len(), 2);

        // Same date, different diff: the recorded entry wins.
        let (second, inserted) = store.insert_job_if_absent(&new_job(1, &["zzz"])).unwrap();
        assert!(!inserted);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.diff, first.diff);
    }

    #[test]
    fn test_find_and_latest() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_job_if_absent(&new_job(1, &[])).unwrap();
        let (later, _) = store.insert_job_if_absent(&new_job(2, &["x"])).unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert!(store.find_job(date, "UTC").unwrap().is_some());
        assert!(store.find_job(date, "+02:00").unwrap().is_none());
        assert_eq!(store.latest_job().unwrap().unwrap().job_id, later.job_id);
    }

    #[test]
    fn test_was_deleted_searches_all_jobs() {
        let store = SqliteStore::in_memory().unwrap();
        let mut job = new_job(1, &["a"]);
        job.diff.deleted = ["gone".to_string()].into_iter().collect();
        store.insert_job_if_absent(&job).unwrap();
        store.insert_job_if_absent(&new_job(2, &["b"])).unwrap();

        assert!(store.was_deleted("gone").unwrap());
        assert!(!store.was_deleted("a").unwrap());
        assert!(!store.was_deleted("never-seen").unwrap());
    }

    #[test]
    fn test_task_recorded_once() {
        let store = SqliteStore::in_memory().unwrap();
        let (job, _) = store.insert_job_if_absent(&new_job(1, &[])).unwrap();
        let start = Utc::now();
        let task = TaskStatus::new(job.job_id, "ingest-raw", start, start);

        assert!(store.record_task(&task).unwrap());
        assert!(!store.record_task(&task).unwrap());
        let tasks = store.tasks_for_job(job.job_id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_name, "ingest-raw");
    }
}
