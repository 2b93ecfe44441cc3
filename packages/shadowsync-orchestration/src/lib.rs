/*
 * shadowsync Orchestration - Incremental Snapshot Synchronization
 *
 * Mirrors periodic snapshots of an upstream entity store into relational
 * tables, touching only what changed since the previous snapshot.
 *
 * Architecture:
 * - Snapshot diff (created / modified / important / deleted)
 * - Job ledger with per-stage resume
 * - Declarative table mapping (YAML) + custom resolvers
 * - Shadow tables, then real tables (row identity preserved)
 * - Cascading invalidation over logical foreign keys
 * - Row reservations for concurrent workers
 */

// Public modules
pub mod catalog;
pub mod config;
pub mod dag;
pub mod dependency_graph;
pub mod diff;
pub mod error;
pub mod job;
pub mod ledger;
pub mod mapping;
pub mod orchestrator;
pub mod pipeline;
pub mod resolver;
pub mod snapshot;
pub mod stages;

// Re-exports
pub use catalog::{MembershipSpec, TableCatalog};
pub use config::{ConfigError, ImportanceConfig, PipelineConfig, SourceMode};
pub use dag::{TableGraph, TableNode};
pub use dependency_graph::{compute_affected_tables, Referrer, ReverseReferenceIndex};
pub use diff::{BacktrackWindow, Fingerprint, ImportanceFilter, SnapshotDiffer};
pub use error::{EntityError, ErrorCategory, OrchestratorError, Result};
pub use job::{JobProgress, Stage};
pub use ledger::JobLedger;
pub use mapping::{
    ColumnMapping, ColumnSource, EntityMapping, MappingTable, MembershipColumn, MembershipMapping,
};
pub use orchestrator::PipelineOrchestrator;
pub use pipeline::{
    RunOptions, RunReport, StageContext, StageFailure, StageHandler, StageReport,
};
pub use resolver::{declarative_resolvers, DeclarativeResolver, EntityResolver, ResolveContext};
pub use snapshot::{
    JsonDumpSource, JsonLinesSource, Page, PageFetcher, PagedSource, Snapshot, SnapshotRecord,
    SnapshotSource,
};
pub use stages::{
    default_stages, AggregateCommand, AggregateRegistry, AggregateStage, CascadeDepth,
    DownstreamAggregates, FieldUpdater, IngestScope, InvalidationCascade, MembershipPopulator,
    RawIngestStage, RealSynchronizer, ShadowPopulator,
};
