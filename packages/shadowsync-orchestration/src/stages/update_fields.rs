use shadowsync_storage::{
    key_string, BatchWriter, RowUpdate, SqlValue, TableLayer, TableSchema, WriteMode,
};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::stages::real_sync::key_filter;

/// Real table synchronizer, update pass
///
/// Every real row whose shadow counterpart (same entity, same primary key)
/// now holds different values is updated column by column. This covers
/// importantly modified entities and the dependents re-resolved under
/// them. The row keeps its identity (`rowid`), so anything pointing at it
/// stays valid.
pub struct FieldUpdater;

impl FieldUpdater {
    pub fn new() -> Self {
        Self
    }

    fn update_table(
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
        let value_columns = schema.value_columns();
        let mut writer = BatchWriter::new(ctx.store.row_update_sink(&real), WriteMode::Insert);

        for (resolved, current) in ctx.store.diverged_rows(schema, &shadow, &real)? {
            let key = schema.key_of(&resolved)?;
            if key != schema.key_of(&current)? {
                // re-keyed rows were replaced by the copy pass
                continue;
            }
            let changes: Vec<(String, SqlValue)> = value_columns
                .iter()
                .filter_map(|col| {
                    let new = resolved.get(*col).cloned().unwrap_or(SqlValue::Null);
                    let old = current.get(*col).cloned().unwrap_or(SqlValue::Null);
                    (new != old).then(|| (col.to_string(), new))
                })
                .collect();
            if changes.is_empty() {
                continue;
            }
            debug!("{} {}: updating {} columns", real, key_string(&key), changes.len());
            writer.add(RowUpdate {
                key: key_filter(schema, &resolved)?,
                changes,
            });
            writer.flush(ctx.config.batch_size)?;
        }
        let written = report.absorb_write(writer.finish()?);
        report.ingested += written;
        Ok(())
    }
}

impl Default for FieldUpdater {
    fn default() -> Self {
        Self::new()
    }
}

impl StageHandler for FieldUpdater {
    fn stage(&self) -> Stage {
        Stage::UpdateFields
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageReport> {
        let start = Instant::now();
        let mut report = StageReport::new(Stage::UpdateFields);

        for table in ctx.catalog.entity_tables() {
            if ctx.is_excluded(table) {
                continue;
            }
            let Some(schema) = ctx.catalog.schema(table) else {
                continue;
            };
            self.update_table(ctx, schema, &mut report)?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Field updates: {} rows updated in {}ms ({} failed writes)",
            report.ingested, report.duration_ms, report.failed_write
        );
        Ok(report)
    }
}
