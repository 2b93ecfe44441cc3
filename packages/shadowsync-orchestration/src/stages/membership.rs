use shadowsync_storage::{BatchWriter, JoinSide, Row, SqlValue, TableLayer, WriteMode};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::MembershipSpec;
use crate::error::{EntityError, Result};
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageReport};

/// Membership populator
///
/// One set-oriented join per membership table. When the backend refuses the
/// join, every (parent, value) pair is resolved on its own and written
/// through the row-isolating batch path.
pub struct MembershipPopulator;

impl MembershipPopulator {
    pub fn new() -> Self {
        Self
    }

    pub fn populate_table(&self, ctx: &StageContext<'_>, table: &str, report: &mut StageReport) -> Result<()> {
        let (Some(spec), Some(join)) = (
            ctx.catalog.membership(table),
            ctx.catalog
                .membership_join(table, TableLayer::Shadow, &ctx.config.table_prefix),
        ) else {
            return Ok(());
        };

        match ctx
            .store
            .membership_join(&join, ctx.config.membership_bulk_limit, WriteMode::SkipExisting)
        {
            Ok(stats) => {
                let unresolved = stats.candidates.saturating_sub(stats.resolvable);
                report.ingested += stats.inserted;
                report.skipped_dependency += unresolved;
                info!(
                    "{}: {} rows inserted ({} candidates, {} unresolved)",
                    table, stats.inserted, stats.candidates, unresolved
                );
                Ok(())
            }
            Err(e) if e.is_row_level() => {
                warn!("{}: bulk join rejected ({}), falling back to per-pair inserts", table, e);
                self.populate_pairwise(ctx, spec, &join.target, report)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn populate_pairwise(
        &self,
        ctx: &StageContext<'_>,
        spec: &MembershipSpec,
        physical: &str,
        report: &mut StageReport,
    ) -> Result<()> {
        let resolve_ctx = ctx.resolve_context();
        let mapping = &spec.mapping;
        let mut writer = BatchWriter::new(
            ctx.store.table_row_sink(&spec.schema, physical),
            WriteMode::SkipExisting,
        );

        let parents = ctx.store.entity_ids_of_type(&mapping.parent_type)?;
        for chunk in parents.chunks(ctx.config.batch_size) {
            for entity in ctx.store.load_entities(chunk)? {
                let key = entity.id().to_string();
                let values = match entity.list(&mapping.field) {
                    Ok(values) if !values.is_empty() => values,
                    _ => continue,
                };
                let parent = match resolve_ctx.lookup(
                    &mapping.parent_table,
                    &spec.parent_source_column,
                    &SqlValue::text(key.as_str()),
                ) {
                    Ok(Some(row)) => row,
                    Ok(None) => {
                        debug!("{} {}: parent not resolved", mapping.table, key);
                        report.skipped_dependency += values.len();
                        continue;
                    }
                    Err(e) => {
                        report.record_entity_error(&mapping.table, &key, &e);
                        continue;
                    }
                };

                for value in values {
                    let pair = format!("{}|{}", key, value);
                    let other = match resolve_ctx.require(
                        &mapping.other_table,
                        &spec.other_match_column,
                        value,
                    ) {
                        Ok(row) => row,
                        Err(e) => {
                            report.record_entity_error(&mapping.table, &pair, &e);
                            continue;
                        }
                    };
                    match membership_row(spec, &parent, &other) {
                        Ok(row) => writer.add(row),
                        Err(e) => report.record_entity_error(&mapping.table, &pair, &e),
                    }
                    writer.flush(ctx.config.batch_size)?;
                }
            }
        }

        let stats = writer.finish()?;
        let fallbacks = stats.bulk_fallbacks;
        let written = report.absorb_write(stats);
        report.ingested += written;
        info!(
            "{}: {} rows inserted pair by pair ({} batches retried row by row)",
            mapping.table, written, fallbacks
        );
        Ok(())
    }
}

fn membership_row(spec: &MembershipSpec, parent: &Row, other: &Row) -> std::result::Result<Row, EntityError> {
    let mut row = Row::new();
    for column in &spec.mapping.columns {
        let source = match column.from {
            JoinSide::Parent => parent,
            JoinSide::Other => other,
        };
        let value = source.get(&column.column).cloned().ok_or_else(|| {
            EntityError::integrity(format!(
                "column '{}' missing from the {:?} row",
                column.column, column.from
            ))
        })?;
        row.insert(column.name.clone(), value);
    }
    Ok(row)
}

impl Default for MembershipPopulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StageHandler for MembershipPopulator {
    fn stage(&self) -> Stage {
        Stage::PopulateMembership
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageReport> {
        let start = Instant::now();
        let mut report = StageReport::new(Stage::PopulateMembership);

        for table in ctx.catalog.membership_tables() {
            if ctx.is_excluded(table) {
                debug!("{}: excluded", table);
                continue;
            }
            self.populate_table(ctx, table, &mut report)?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Membership tables: {} rows in {}ms ({} unresolved, {} failed writes)",
            report.ingested,
            report.duration_ms,
            report.skipped(),
            report.failed_write
        );
        Ok(report)
    }
}
