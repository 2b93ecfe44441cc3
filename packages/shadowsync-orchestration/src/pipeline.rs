use chrono::NaiveDate;
use serde::Serialize;
use shadowsync_storage::{
    JobEntry, ReservationStore, ReserveOutcome, SqliteStore, StorageError, TableLayer, TableSchema,
    WriteStats,
};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

use crate::catalog::TableCatalog;
use crate::config::PipelineConfig;
use crate::error::{EntityError, Result};
use crate::job::Stage;
use crate::resolver::ResolveContext;
use crate::snapshot::Snapshot;
use crate::stages::AggregateCommand;

/// Failures listed per stage; counters stay exact beyond this.
pub const MAX_REPORTED_FAILURES: usize = 100;

/// Per-run options chosen by the caller
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub command: AggregateCommand,
    /// Skip aggregate hooks flagged as plotting
    pub skip_plots: bool,
    /// Start here, re-running stages already recorded
    pub from_stage: Option<Stage>,
    /// Stop between stages once this instant has passed
    pub deadline: Option<Instant>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            command: AggregateCommand::Ingest,
            skip_plots: false,
            from_stage: None,
            deadline: None,
        }
    }
}

/// Stage context passed to handlers
pub struct StageContext<'a> {
    pub store: &'a SqliteStore,
    pub config: &'a PipelineConfig,
    pub catalog: &'a TableCatalog,
    pub job: &'a JobEntry,
    pub snapshot: &'a Snapshot,
    pub worker_id: &'a str,
    pub options: &'a RunOptions,
}

impl<'a> StageContext<'a> {
    pub fn physical(&self, schema: &TableSchema, layer: TableLayer) -> String {
        schema.physical_name(layer, &self.config.table_prefix)
    }

    pub fn resolve_context(&self) -> ResolveContext<'_> {
        ResolveContext {
            store: self.store,
            catalog: self.catalog,
            prefix: &self.config.table_prefix,
            known_deleted: &self.job.diff.deleted,
        }
    }

    /// Claim one row for this worker. `false` means skip it: another worker
    /// holds it, or an earlier attempt failed permanently.
    pub fn reserve(
        &self,
        table: &str,
        key: &str,
        report: &mut StageReport,
    ) -> std::result::Result<bool, StorageError> {
        match self
            .store
            .reserve(table, key, self.worker_id, self.config.reservation_timeout())?
        {
            ReserveOutcome::Acquired => Ok(true),
            ReserveOutcome::HeldByOther { worker_id } => {
                debug!("{} {}: reserved by {}", table, key, worker_id);
                report.skipped_reserved += 1;
                Ok(false)
            }
            ReserveOutcome::Errored { message } => {
                debug!(
                    "{} {}: marked as failed ({})",
                    table,
                    key,
                    message.as_deref().unwrap_or("no message")
                );
                report.skipped_integrity += 1;
                Ok(false)
            }
        }
    }

    pub fn is_excluded(&self, table: &str) -> bool {
        self.config.is_excluded(table)
    }
}

/// One skipped entity or row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub table: String,
    pub key: String,
    pub kind: String,
    pub message: String,
}

/// Counters of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub ingested: usize,
    pub skipped_dependency: usize,
    pub skipped_integrity: usize,
    pub skipped_referential: usize,
    pub skipped_reserved: usize,
    pub failed_write: usize,
    pub duration_ms: u64,
    pub failures: Vec<StageFailure>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            ingested: 0,
            skipped_dependency: 0,
            skipped_integrity: 0,
            skipped_referential: 0,
            skipped_reserved: 0,
            failed_write: 0,
            duration_ms: 0,
            failures: Vec::new(),
        }
    }

    /// Count an entity skipped at the entity boundary
    pub fn record_entity_error(&mut self, table: &str, key: &str, error: &EntityError) {
        match error {
            EntityError::MissingDependency { .. } => {
                debug!("{} {}: {}", table, key, error);
                self.skipped_dependency += 1;
            }
            EntityError::DataIntegrity(_) => self.skipped_integrity += 1,
            EntityError::ReferentialViolation { .. } => self.skipped_referential += 1,
            EntityError::TransientWrite(_) => self.failed_write += 1,
        }
        if !matches!(error, EntityError::MissingDependency { .. }) {
            warn!("{} {} ({}): {}", table, key, error.category(), error);
            self.push_failure(table, key, error.kind(), error.to_string());
        }
    }

    /// Fold BatchWriter results in; returns the rows written.
    pub fn absorb_write(&mut self, stats: WriteStats) -> usize {
        self.failed_write += stats.failed;
        for failure in stats.failures {
            self.push_failure(&failure.target, &failure.key, "write", failure.message);
        }
        stats.written
    }

    pub(crate) fn push_failure(&mut self, table: &str, key: &str, kind: &str, message: String) {
        if self.failures.len() < MAX_REPORTED_FAILURES {
            self.failures.push(StageFailure {
                table: table.to_string(),
                key: key.to_string(),
                kind: kind.to_string(),
                message,
            });
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_dependency
            + self.skipped_integrity
            + self.skipped_referential
            + self.skipped_reserved
    }
}

/// Stage handler trait (pluggable stages)
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    /// Nothing to do for this job
    fn can_skip(&self, _ctx: &StageContext<'_>) -> bool {
        false
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageReport>;
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job_id: i64,
    pub job_date: NaiveDate,
    pub diff_summary: String,
    pub stages: Vec<StageReport>,
    /// Stages already recorded for the job
    pub skipped_stages: Vec<Stage>,
    /// Stopped between stages (deadline or shutdown)
    pub interrupted: bool,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn completed(&self) -> BTreeSet<Stage> {
        self.stages
            .iter()
            .map(|r| r.stage)
            .chain(self.skipped_stages.iter().copied())
            .collect()
    }

    pub fn total_failed_writes(&self) -> usize {
        self.stages.iter().map(|r| r.failed_write).sum()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Job {} ({}): {}{}",
            self.job_id,
            self.job_date,
            self.diff_summary,
            if self.interrupted { " [interrupted]" } else { "" }
        )?;
        writeln!(
            f,
            "{:<22} {:>9} {:>8} {:>9} {:>8} {:>8} {:>7} {:>9}",
            "stage", "ingested", "dep", "integrity", "ref", "reserved", "write", "ms"
        )?;
        for r in &self.stages {
            writeln!(
                f,
                "{:<22} {:>9} {:>8} {:>9} {:>8} {:>8} {:>7} {:>9}",
                r.stage.as_str(),
                r.ingested,
                r.skipped_dependency,
                r.skipped_integrity,
                r.skipped_referential,
                r.skipped_reserved,
                r.failed_write,
                r.duration_ms
            )?;
        }
        for stage in &self.skipped_stages {
            writeln!(f, "{:<22} (already recorded)", stage.as_str())?;
        }
        write!(f, "total {} ms", self.duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowsync_storage::RowFailure;

    #[test]
    fn test_entity_errors_are_counted_by_kind() {
        let mut report = StageReport::new(Stage::PopulateShadow);
        report.record_entity_error("session", "k1", &EntityError::missing("subject", "u1"));
        report.record_entity_error("session", "k2", &EntityError::integrity("bad lengths"));
        report.record_entity_error("session", "k3", &EntityError::referential("subject", "u9"));

        assert_eq!(report.skipped_dependency, 1);
        assert_eq!(report.skipped_integrity, 1);
        assert_eq!(report.skipped_referential, 1);
        assert_eq!(report.skipped(), 3);
        // missing dependencies heal on their own and are not listed
        let kinds: Vec<&str> = report.failures.iter().map(|f| f.kind.as_str()).collect();
        assert_eq!(kinds, vec!["data_integrity", "referential_violation"]);
    }

    #[test]
    fn test_absorb_write() {
        let mut report = StageReport::new(Stage::SyncReal);
        let stats = WriteStats {
            written: 9,
            failed: 1,
            bulk_fallbacks: 1,
            failures: vec![RowFailure {
                target: "session".to_string(),
                key: "k".to_string(),
                message: "NOT NULL".to_string(),
            }],
        };
        assert_eq!(report.absorb_write(stats), 9);
        assert_eq!(report.failed_write, 1);
        assert_eq!(report.failures[0].kind, "write");
    }

    #[test]
    fn test_failure_list_is_capped() {
        let mut report = StageReport::new(Stage::PopulateShadow);
        for i in 0..(MAX_REPORTED_FAILURES + 5) {
            report.record_entity_error("t", &i.to_string(), &EntityError::integrity("x"));
        }
        assert_eq!(report.failures.len(), MAX_REPORTED_FAILURES);
        assert_eq!(report.skipped_integrity, MAX_REPORTED_FAILURES + 5);
    }

    #[test]
    fn test_run_report_table() {
        let mut shadow = StageReport::new(Stage::PopulateShadow);
        shadow.ingested = 12;
        shadow.skipped_dependency = 2;
        let report = RunReport {
            job_id: 4,
            job_date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            diff_summary: "+12 ~0 (important 0) -0".to_string(),
            stages: vec![shadow],
            skipped_stages: vec![Stage::IngestRaw],
            interrupted: false,
            duration_ms: 40,
        };
        let table = report.to_string();
        assert!(table.starts_with("Job 4 (2024-07-01): +12"));
        assert!(table.contains("populate-shadow"));
        assert!(table.contains("(already recorded)"));
        assert_eq!(
            report.completed(),
            [Stage::IngestRaw, Stage::PopulateShadow].into_iter().collect()
        );
    }
}
