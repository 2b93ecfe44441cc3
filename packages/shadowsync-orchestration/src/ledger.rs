//! Job ledger: one job per `(job_date, timezone)`.
//!
//! The diff is computed and persisted once; a second start for the same date
//! returns the recorded job unchanged, with its completed stages, so the run
//! resumes where it stopped.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use shadowsync_storage::{LedgerStore, NewJob, TaskStatus};
use tracing::info;

use crate::config::PipelineConfig;
use crate::diff::SnapshotDiffer;
use crate::error::Result;
use crate::job::{JobProgress, Stage};
use crate::snapshot::Snapshot;

pub struct JobLedger<S: LedgerStore> {
    store: S,
    offset: FixedOffset,
    timezone: String,
}

impl<S: LedgerStore> JobLedger<S> {
    pub fn new(store: S, config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            store,
            offset: config.offset()?,
            timezone: config.timezone.clone(),
        })
    }

    /// Calendar date of `ts` in the configured timezone
    pub fn job_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.offset).date_naive()
    }

    /// The job already recorded for this snapshot's date, if any.
    pub fn existing(&self, current: &Snapshot) -> Result<Option<JobProgress>> {
        let job_date = self.job_date(current.taken_at);
        match self.store.find_job(job_date, &self.timezone)? {
            Some(job) => {
                let tasks = self.store.tasks_for_job(job.job_id)?;
                Ok(Some(JobProgress::new(job, &tasks)))
            }
            None => Ok(None),
        }
    }

    /// Diff `previous` against `current` and record the job, unless one
    /// exists for the date already (then the recorded one is returned).
    pub fn start_job(
        &self,
        current: &Snapshot,
        previous: &Snapshot,
        differ: &SnapshotDiffer,
    ) -> Result<JobProgress> {
        if let Some(existing) = self.existing(current)? {
            return Ok(existing);
        }

        let diff = differ.diff(previous, current);
        let new_job = NewJob {
            job_date: self.job_date(current.taken_at),
            timezone: self.timezone.clone(),
            current_snapshot_ts: current.taken_at,
            previous_snapshot_ts: if previous.is_empty() {
                None
            } else {
                Some(previous.taken_at)
            },
            diff,
        };

        let (job, inserted) = self.store.insert_job_if_absent(&new_job)?;
        let tasks = if inserted {
            info!(
                "Job {} recorded for {} ({}): {}",
                job.job_id,
                job.job_date,
                job.timezone,
                job.diff.summary()
            );
            Vec::new()
        } else {
            // another worker recorded the date first
            self.store.tasks_for_job(job.job_id)?
        };
        Ok(JobProgress::new(job, &tasks))
    }

    pub fn record_task(
        &self,
        job_id: i64,
        stage: Stage,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .store
            .record_task(&TaskStatus::new(job_id, stage.as_str(), start, end))?)
    }

    /// Snapshot time of the most recent job
    pub fn last_snapshot_ts(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.store.latest_job()?.map(|job| job.current_snapshot_ts))
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }
}
