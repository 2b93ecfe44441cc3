//! Downstream aggregate hooks
//!
//! Domain recomputation (behavior criteria, wheel moves, ephys summaries)
//! lives in the embedding application. It registers hooks here; the
//! `downstream-aggregates` stage runs the ones selected by the command.

use serde::{Deserialize, Serialize};
use shadowsync_storage::{JobEntry, SqliteStore};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageReport};

/// Top-level command of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateCommand {
    /// Synchronization only
    Ingest,
    Behavior,
    Wheel,
    Ephys,
}

impl AggregateCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateCommand::Ingest => "ingest",
            AggregateCommand::Behavior => "behavior",
            AggregateCommand::Wheel => "wheel",
            AggregateCommand::Ephys => "ephys",
        }
    }
}

impl fmt::Display for AggregateCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recomputation registered by the embedding application.
pub trait AggregateStage: Send + Sync {
    fn name(&self) -> &str;

    /// Commands that trigger this hook
    fn commands(&self) -> &[AggregateCommand];

    /// Optional plotting work, skipped with `--xplots`
    fn is_plotting(&self) -> bool {
        false
    }

    /// Returns the number of rows produced.
    fn run(&self, store: &SqliteStore, job: &JobEntry) -> anyhow::Result<usize>;
}

#[derive(Default)]
pub struct AggregateRegistry {
    hooks: Vec<Box<dyn AggregateStage>>,
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Box<dyn AggregateStage>) {
        self.hooks.push(hook);
    }

    /// Hooks for `command`, in registration order
    pub fn selected(&self, command: AggregateCommand, skip_plots: bool) -> Vec<&dyn AggregateStage> {
        self.hooks
            .iter()
            .map(|h| h.as_ref())
            .filter(|h| h.commands().contains(&command))
            .filter(|h| !(skip_plots && h.is_plotting()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// The `downstream-aggregates` stage. A failing hook is reported, not fatal.
pub struct DownstreamAggregates {
    registry: Arc<AggregateRegistry>,
}

impl DownstreamAggregates {
    pub fn new(registry: Arc<AggregateRegistry>) -> Self {
        Self { registry }
    }
}

impl StageHandler for DownstreamAggregates {
    fn stage(&self) -> Stage {
        Stage::DownstreamAggregates
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageReport> {
        let start = Instant::now();
        let mut report = StageReport::new(Stage::DownstreamAggregates);
        let hooks = self
            .registry
            .selected(ctx.options.command, ctx.options.skip_plots);
        info!("{}: {} aggregate hooks", ctx.options.command, hooks.len());

        for hook in hooks {
            let hook_start = Instant::now();
            match hook.run(ctx.store, ctx.job) {
                Ok(rows) => {
                    info!("{}: {} rows in {}ms", hook.name(), rows, hook_start.elapsed().as_millis());
                    report.ingested += rows;
                }
                Err(e) => {
                    warn!("{} failed: {:#}", hook.name(), e);
                    report.failed_write += 1;
                    let date = ctx.job.job_date.to_string();
                    report.push_failure(hook.name(), &date, "aggregate", format!("{:#}", e));
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }
}
