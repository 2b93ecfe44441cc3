use shadowsync_storage::{
    key_string, BatchWriter, DeletePlan, DeleteStep, Filter, ReservationStore, Row, TableLayer,
    TableSchema, WriteMode,
};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::stages::cascade::{plan_dependents, CascadeDepth};

/// Real table synchronizer, copy pass
///
/// Tables are visited parents first. For each, real rows whose entity now
/// resolves to a different primary key are removed, then shadow rows missing
/// from the real table are copied. Rows of dependents that keep their key
/// stay in place; [`super::FieldUpdater`] brings their columns up to date.
pub struct RealSynchronizer;

/// Primary key filter of `row`
pub(crate) fn key_filter(schema: &TableSchema, row: &Row) -> Result<Filter> {
    let values = schema.key_of(row)?;
    Ok(schema.primary_key.iter().cloned().zip(values).collect())
}

impl RealSynchronizer {
    pub fn new() -> Self {
        Self
    }

    /// Remove real rows whose entity now resolves to a different primary
    /// key, with the membership rows pointing at them. The shadow row is
    /// copied right after; rows that keep their key are left to
    /// [`super::FieldUpdater`].
    fn prune_rekeyed(
        &self,
        ctx: &StageContext<'_>,
        schema: &TableSchema,
        report: &mut StageReport,
    ) -> Result<()> {
        if schema.source_column.is_none() {
            return Ok(());
        }
        let shadow = ctx.physical(schema, TableLayer::Shadow);
        let real = ctx.physical(schema, TableLayer::Real);

        let mut writer = BatchWriter::new(ctx.store.delete_plan_sink(), WriteMode::Insert);
        let mut visited = HashSet::new();
        for (resolved, current) in ctx.store.diverged_rows(schema, &shadow, &real)? {
            let new_key = key_string(&schema.key_of(&resolved)?);
            let old_key = key_string(&schema.key_of(&current)?);
            if new_key == old_key {
                continue;
            }
            debug!("{}: {} re-keyed to {}", schema.name, old_key, new_key);
            let mut steps: Vec<DeleteStep> = Vec::new();
            plan_dependents(
                ctx,
                &schema.name,
                &current,
                TableLayer::Real,
                CascadeDepth::Memberships,
                &mut visited,
                &mut steps,
            )?;
            steps.push(DeleteStep {
                table: real.clone(),
                filter: key_filter(schema, &current)?,
            });
            writer.add(DeletePlan {
                key: old_key,
                steps,
            });
            writer.flush(ctx.config.batch_size)?;
        }
        report.absorb_write(writer.finish()?);
        Ok(())
    }

    /// Copy shadow rows absent from the real table.
    fn copy_missing(
        &self,
        ctx: &StageContext<'_>,
        schema: &TableSchema,
        report: &mut StageReport,
    ) -> Result<()> {
        let shadow = ctx.physical(schema, TableLayer::Shadow);
        let real = ctx.physical(schema, TableLayer::Real);
        let missing = ctx.store.rows_missing_from(schema, &shadow, &real)?;
        if missing.is_empty() {
            return Ok(());
        }
        debug!("{}: {} rows to copy", real, missing.len());

        let mut writer = BatchWriter::new(
            ctx.store.table_row_sink(schema, &real),
            WriteMode::SkipExisting,
        );
        let mut reserved = Vec::new();
        for row in missing {
            let key = key_string(&schema.key_of(&row)?);
            if !ctx.reserve(&real, &key, report)? {
                continue;
            }
            reserved.push(key);
            writer.add(row);
            writer.flush(ctx.config.batch_size)?;
        }
        let written = report.absorb_write(writer.finish()?);
        report.ingested += written;
        ctx.store.release(&real, &reserved, ctx.worker_id)?;
        Ok(())
    }
}

impl Default for RealSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StageHandler for RealSynchronizer {
    fn stage(&self) -> Stage {
        Stage::SyncReal
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageReport> {
        let start = Instant::now();
        let mut report = StageReport::new(Stage::SyncReal);

        for table in ctx.catalog.order() {
            if ctx.is_excluded(table) {
                debug!("{}: excluded", table);
                continue;
            }
            let Some(schema) = ctx.catalog.schema(table) else {
                continue;
            };
            if !schema.is_membership() {
                self.prune_rekeyed(ctx, schema, &mut report)?;
            }
            self.copy_missing(ctx, schema, &mut report)?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Real tables: {} rows copied in {}ms ({} reserved elsewhere, {} failed writes)",
            report.ingested, report.duration_ms, report.skipped_reserved, report.failed_write
        );
        Ok(report)
    }
}
