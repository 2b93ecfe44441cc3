//! shadowsync CLI
//!
//! # Usage
//!
//! ```bash
//! # Synchronize one snapshot
//! shadowsync ingest --snapshot dump.json --mapping mapping.yaml --db sync.db
//!
//! # Keep re-reading the dump every 10 minutes, forever
//! shadowsync ingest --snapshot dump.json --mapping mapping.yaml --duration -1 --sleep 600
//!
//! # Re-run the real-table stages of today's job, skipping two tables
//! shadowsync behavior --snapshot dump.json --mapping mapping.yaml \
//!     --from-stage sync-real --xtable trials --xtable wheel_moves --xplots
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shadowsync_orchestration::{
    AggregateCommand, AggregateRegistry, JsonDumpSource, JsonLinesSource, MappingTable,
    PipelineConfig, PipelineOrchestrator, RunOptions, RunReport, Snapshot, SnapshotSource,
    SourceMode, Stage, TableCatalog,
};
use shadowsync_storage::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shadowsync")]
#[command(about = "Incremental snapshot synchronization into relational tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize tables only
    Ingest(RunArgs),
    /// Synchronize, then run behavior aggregate hooks
    Behavior(RunArgs),
    /// Synchronize, then run wheel aggregate hooks
    Wheel(RunArgs),
    /// Synchronize, then run ephys aggregate hooks
    Ephys(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Snapshot export (.json dump or .jsonl)
    #[arg(long)]
    snapshot: PathBuf,

    /// Baseline snapshot for the first iteration (default: the raw store)
    #[arg(long)]
    previous: Option<PathBuf>,

    /// Table mapping file
    #[arg(long)]
    mapping: PathBuf,

    /// Pipeline configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database
    #[arg(long, default_value = "shadowsync.db")]
    db: PathBuf,

    /// Run length in seconds; 0 runs once, negative runs until interrupted
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    duration: i64,

    /// Seconds between iterations
    #[arg(long, default_value = "0")]
    sleep: u64,

    /// Days of history to treat as modified
    #[arg(long)]
    backtrack: Option<u32>,

    /// Exclude a table (repeatable)
    #[arg(long = "xtable")]
    xtable: Vec<String>,

    /// Skip plotting hooks
    #[arg(long)]
    xplots: bool,

    /// Start at this stage, re-running it and every later one
    #[arg(long)]
    from_stage: Option<String>,

    /// Debug logging for shadowsync crates
    #[arg(short, long)]
    verbose: bool,
}

impl Commands {
    fn split(self) -> (AggregateCommand, RunArgs) {
        match self {
            Commands::Ingest(args) => (AggregateCommand::Ingest, args),
            Commands::Behavior(args) => (AggregateCommand::Behavior, args),
            Commands::Wheel(args) => (AggregateCommand::Wheel, args),
            Commands::Ephys(args) => (AggregateCommand::Ephys, args),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (command, args) = cli.command.split();
    init_tracing(args.verbose);

    let config = load_config(&args)?;
    if config.mode == SourceMode::Live {
        bail!("live mode needs a page fetcher supplied by the embedding application; use dump mode from the CLI");
    }
    let mapping = MappingTable::from_yaml(&args.mapping)
        .with_context(|| format!("loading mapping {}", args.mapping.display()))?;
    let catalog = TableCatalog::from_mapping(&mapping)?;
    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("opening {}", args.db.display()))?;

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store,
        config,
        catalog,
        Arc::new(AggregateRegistry::new()),
    )?);
    orchestrator.prepare()?;

    let from_stage = args
        .from_stage
        .as_deref()
        .map(Stage::from_str)
        .transpose()?;

    let stop = orchestrator.stop_handle();
    let wake = Arc::new(Notify::new());
    {
        let stop = Arc::clone(&stop);
        let wake = Arc::clone(&wake);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current stage");
                stop.store(true, Ordering::SeqCst);
                wake.notify_one();
            }
        });
    }

    let started = Instant::now();
    let deadline = (args.duration > 0).then(|| started + Duration::from_secs(args.duration as u64));
    let mut previous = match &args.previous {
        Some(path) => Some(load_snapshot(path)?),
        None => None,
    };
    let mut iteration = 0usize;

    loop {
        iteration += 1;
        let options = RunOptions {
            command,
            skip_plots: args.xplots,
            from_stage: if iteration == 1 { from_stage } else { None },
            deadline,
        };
        let snapshot_path = args.snapshot.clone();
        let baseline = previous.take();
        let worker = Arc::clone(&orchestrator);

        let report: RunReport = tokio::task::spawn_blocking(move || -> Result<RunReport> {
            let current = load_snapshot(&snapshot_path)?;
            Ok(worker.run_once(&current, baseline.as_ref(), &options)?)
        })
        .await
        .context("pipeline task panicked")??;

        println!("{}", report);

        if args.duration == 0 || stop.load(Ordering::SeqCst) || report.interrupted {
            break;
        }
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            info!("Run duration reached after {} iterations", iteration);
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.sleep)) => {}
            _ = wake.notified() => break,
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,shadowsync_orchestration=debug,shadowsync_storage=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_yaml(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(days) = args.backtrack {
        config = config.with_backtrack_days(days);
    }
    config = config.exclude_tables(args.xtable.iter().cloned());
    config.validate()?;
    Ok(config)
}

fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let is_lines = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jsonl"))
        .unwrap_or(false);
    let snapshot = if is_lines {
        JsonLinesSource::new(path).load()?
    } else {
        JsonDumpSource::new(path).load()?
    };
    Ok(snapshot)
}
