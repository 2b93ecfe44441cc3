use shadowsync_storage::{BatchWriter, ReservationStore, TableLayer, WriteMode};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{EntityError, Result};
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageReport};

/// Shadow populator
///
/// Walks the entity tables parents first. Each table's pass is flushed
/// before the next table starts, so children always see their parents.
pub struct ShadowPopulator;

impl ShadowPopulator {
    pub fn new() -> Self {
        Self
    }

    /// One table: resolve every raw entity of its type not yet present.
    pub fn populate_table(
        &self,
        ctx: &StageContext<'_>,
        table: &str,
        report: &mut StageReport,
    ) -> Result<()> {
        let Some(resolver) = ctx.catalog.resolver(table) else {
            return Ok(());
        };
        let schema = resolver.schema();
        let physical = ctx.physical(schema, TableLayer::Shadow);
        let pending = resolver.select(ctx.store, &physical)?;
        if pending.is_empty() {
            debug!("{}: nothing to resolve", table);
            return Ok(());
        }
        info!("{}: resolving {} entities", table, pending.len());

        let resolve_ctx = ctx.resolve_context();
        let mut writer = BatchWriter::new(
            ctx.store.table_row_sink(schema, &physical),
            WriteMode::SkipExisting,
        );
        let mut reserved = Vec::new();

        for chunk in pending.chunks(ctx.config.batch_size) {
            for entity in ctx.store.load_entities(chunk)? {
                let key = entity.id().to_string();
                if !ctx.reserve(&physical, &key, report)? {
                    continue;
                }
                match resolver.resolve(&entity, &resolve_ctx) {
                    Ok(row) => {
                        writer.add(row);
                        reserved.push(key);
                    }
                    Err(e) => {
                        report.record_entity_error(table, &key, &e);
                        if let EntityError::DataIntegrity(message) = &e {
                            ctx.store.mark_error(&physical, &key, ctx.worker_id, message)?;
                        } else {
                            reserved.push(key);
                        }
                    }
                }
            }
            writer.flush(ctx.config.batch_size)?;
        }

        let stats = writer.finish()?;
        let written = report.absorb_write(stats);
        report.ingested += written;
        ctx.store.release(&physical, &reserved, ctx.worker_id)?;
        Ok(())
    }
}

impl Default for ShadowPopulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StageHandler for ShadowPopulator {
    fn stage(&self) -> Stage {
        Stage::PopulateShadow
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageReport> {
        let start = Instant::now();
        let mut report = StageReport::new(Stage::PopulateShadow);

        for table in ctx.catalog.entity_tables() {
            if ctx.is_excluded(table) {
                debug!("{}: excluded", table);
                continue;
            }
            self.populate_table(ctx, table, &mut report)?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Shadow tables: {} rows in {}ms (dependency {}, integrity {}, referential {}, reserved {}, failed writes {})",
            report.ingested,
            report.duration_ms,
            report.skipped_dependency,
            report.skipped_integrity,
            report.skipped_referential,
            report.skipped_reserved,
            report.failed_write
        );
        Ok(report)
    }
}
