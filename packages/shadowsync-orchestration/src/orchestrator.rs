use chrono::Utc;
use shadowsync_storage::{SqliteStore, TableLayer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::TableCatalog;
use crate::config::PipelineConfig;
use crate::diff::{ImportanceFilter, SnapshotDiffer};
use crate::error::Result;
use crate::job::{JobProgress, Stage};
use crate::ledger::JobLedger;
use crate::pipeline::{RunOptions, RunReport, StageContext, StageHandler, StageReport};
use crate::snapshot::{Snapshot, SnapshotSource};
use crate::stages::{default_stages, AggregateRegistry};

/// Runs the stages of one job against a store.
///
/// Every run is keyed by the snapshot's calendar date: the first run for a
/// date records the diff, later runs for the same date resume from the
/// stages not yet recorded.
pub struct PipelineOrchestrator {
    store: SqliteStore,
    config: PipelineConfig,
    catalog: TableCatalog,
    stages: Vec<Box<dyn StageHandler>>,
    ledger: JobLedger<SqliteStore>,
    worker_id: String,
    stop: Arc<AtomicBool>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator with the default stages
    pub fn new(
        store: SqliteStore,
        config: PipelineConfig,
        catalog: TableCatalog,
        aggregates: Arc<AggregateRegistry>,
    ) -> Result<Self> {
        Self::with_stages(store, config, catalog, default_stages(aggregates))
    }

    /// Create with custom stage handlers, one per [`Stage`]
    pub fn with_stages(
        store: SqliteStore,
        config: PipelineConfig,
        catalog: TableCatalog,
        stages: Vec<Box<dyn StageHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        let ledger = JobLedger::new(store.clone(), &config)?;
        Ok(Self {
            store,
            config,
            catalog,
            stages,
            ledger,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &TableCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &JobLedger<SqliteStore> {
        &self.ledger
    }

    /// Setting the flag stops the run before its next stage.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Create shadow and real tables for every schema in the catalog
    pub fn prepare(&self) -> Result<()> {
        for schema in self.catalog.schemas() {
            for layer in [TableLayer::Shadow, TableLayer::Real] {
                let physical = schema.physical_name(layer, &self.config.table_prefix);
                self.store.create_table(schema, &physical)?;
            }
        }
        info!(
            "Prepared {} tables ({} entity, {} membership)",
            self.catalog.len(),
            self.catalog.entity_tables().len(),
            self.catalog.membership_tables().len()
        );
        Ok(())
    }

    /// Last-known upstream state, rebuilt from the raw store
    pub fn previous_snapshot(&self) -> Result<Snapshot> {
        let taken_at = self
            .ledger
            .last_snapshot_ts()?
            .unwrap_or_else(Utc::now);
        let entities = self.store.load_all_entities()?;
        debug!("Rebuilt previous snapshot from {} raw entities", entities.len());
        Ok(Snapshot::from_raw_entities(taken_at, &entities))
    }

    /// Load the current snapshot from `source` and run one job.
    pub fn run_source(
        &self,
        source: &mut dyn SnapshotSource,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let current = source.load()?;
        self.run_once(&current, None, options)
    }

    /// Run (or resume) the job for `current`'s date.
    ///
    /// Without `previous`, the diff baseline is what the raw store holds.
    pub fn run_once(
        &self,
        current: &Snapshot,
        previous: Option<&Snapshot>,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let start_time = Instant::now();

        let progress = match self.ledger.existing(current)? {
            Some(progress) => {
                info!(
                    "Resuming job {} for {} - {} stages already completed",
                    progress.job.job_id,
                    progress.job.job_date,
                    progress.completed.len()
                );
                progress
            }
            None => {
                let rebuilt;
                let previous = match previous {
                    Some(previous) => previous,
                    None => {
                        rebuilt = self.previous_snapshot()?;
                        &rebuilt
                    }
                };
                let importance = ImportanceFilter::new(self.config.importance.clone())
                    .with_participating_fields(self.catalog.participating_fields());
                let differ = SnapshotDiffer::from_config(&self.config, importance);
                self.ledger.start_job(current, previous, &differ)?
            }
        };

        let mut report = RunReport {
            job_id: progress.job.job_id,
            job_date: progress.job.job_date,
            diff_summary: progress.job.diff.summary(),
            stages: Vec::new(),
            skipped_stages: Vec::new(),
            interrupted: false,
            duration_ms: 0,
        };

        if progress.is_complete() && options.from_stage.is_none() {
            info!(
                "Job {} for {} already complete, nothing to do",
                progress.job.job_id, progress.job.job_date
            );
            report.skipped_stages = Stage::ALL.to_vec();
            report.duration_ms = start_time.elapsed().as_millis() as u64;
            return Ok(report);
        }

        self.run_stages(&progress, current, options, &mut report)?;

        report.duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "Job {} finished in {}ms ({} stages run, {} failed writes{})",
            report.job_id,
            report.duration_ms,
            report.stages.len(),
            report.total_failed_writes(),
            if report.interrupted { ", interrupted" } else { "" }
        );
        Ok(report)
    }

    fn run_stages(
        &self,
        progress: &JobProgress,
        current: &Snapshot,
        options: &RunOptions,
        report: &mut RunReport,
    ) -> Result<()> {
        let pending = progress.pending(options.from_stage);
        let job_id = progress.job.job_id;

        for handler in &self.stages {
            let stage = handler.stage();
            if !pending.contains(&stage) {
                debug!("Job {}: {} already recorded", job_id, stage);
                report.skipped_stages.push(stage);
                continue;
            }
            if self.should_stop(options) {
                warn!("Job {}: stopping before {}", job_id, stage);
                report.interrupted = true;
                break;
            }

            let ctx = StageContext {
                store: &self.store,
                config: &self.config,
                catalog: &self.catalog,
                job: &progress.job,
                snapshot: current,
                worker_id: &self.worker_id,
                options,
            };

            let started = Utc::now();
            let stage_report = if handler.can_skip(&ctx) {
                info!("Job {}: {} has nothing to do", job_id, stage);
                StageReport::new(stage)
            } else {
                info!("Job {}: {} started", job_id, stage);
                handler.execute(&ctx).map_err(|e| {
                    error!("Job {}: {} failed: {}", job_id, stage, e);
                    e
                })?
            };
            if !self.ledger.record_task(job_id, stage, started, Utc::now())? {
                debug!("Job {}: {} was recorded by another worker", job_id, stage);
            }
            report.stages.push(stage_report);
        }
        Ok(())
    }

    fn should_stop(&self, options: &RunOptions) -> bool {
        self.stop.load(Ordering::SeqCst)
            || options
                .deadline
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false)
    }
}
