//! Invalidation cascade
//!
//! For every deleted or importantly modified key, removes the derived rows it
//! produced and the rows referencing them, children first, then its raw
//! fields and record. Unimportant modifications only lose their raw fields
//! (re-ingested right after); their derived rows stay.
//!
//! Per layer:
//! - shadow: the entity's rows and all transitive dependents
//! - real, deleted key: the same
//! - real, modified key: only membership rows referencing the entity's rows;
//!   the rows themselves are updated in place later so their identity
//!   survives

use shadowsync_storage::{
    key_string, BatchWriter, DeletePlan, DeleteStep, Filter, RawStore, ReservationStore, Row,
    SqlValue, TableLayer, WriteMode,
};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::TableCatalog;
use crate::error::Result;
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::stages::canonical_key;

pub struct InvalidationCascade;

/// How far below a row the cascade reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeDepth {
    /// Every transitive dependent
    Full,
    /// Direct membership rows only
    Memberships,
}

/// Filter selecting rows of a referencing table that point at `row`.
/// `None` when a referenced value is null (nothing can match).
fn referrer_filter(columns: &[String], referenced: &[String], row: &Row) -> Option<Filter> {
    columns
        .iter()
        .zip(referenced)
        .map(|(col, referenced_col)| match row.get(referenced_col) {
            Some(value) if !value.is_null() => Some((col.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

/// Delete steps for everything referencing `row` of `table`, deepest first.
/// `visited` holds `(table, key)` pairs already planned.
pub(crate) fn plan_dependents(
    ctx: &StageContext<'_>,
    table: &str,
    row: &Row,
    layer: TableLayer,
    depth: CascadeDepth,
    visited: &mut HashSet<(String, String)>,
    steps: &mut Vec<DeleteStep>,
) -> Result<()> {
    let catalog: &TableCatalog = ctx.catalog;
    for referrer in catalog.references().referencing(table) {
        let Some(schema) = catalog.schema(&referrer.table) else {
            continue;
        };
        if depth == CascadeDepth::Memberships && !schema.is_membership() {
            continue;
        }
        let Some(filter) = referrer_filter(
            &referrer.foreign_key.columns,
            &referrer.foreign_key.referenced_columns,
            row,
        ) else {
            continue;
        };
        let physical = ctx.physical(schema, layer);
        let children = ctx.store.select_rows(schema, &physical, &filter)?;
        if children.is_empty() {
            continue;
        }
        if depth == CascadeDepth::Full {
            for child in &children {
                let key = key_string(&schema.key_of(child)?);
                if visited.insert((referrer.table.clone(), key)) {
                    plan_dependents(ctx, &referrer.table, child, layer, depth, visited, steps)?;
                }
            }
        }
        steps.push(DeleteStep {
            table: physical,
            filter,
        });
    }
    Ok(())
}

impl InvalidationCascade {
    pub fn new() -> Self {
        Self
    }

    /// Delete steps for one key's derived rows in one layer.
    fn plan_layer(
        &self,
        ctx: &StageContext<'_>,
        entity_type: &str,
        key: &str,
        layer: TableLayer,
        depth: CascadeDepth,
        steps: &mut Vec<DeleteStep>,
    ) -> Result<()> {
        let mut visited = HashSet::new();
        for table in ctx.catalog.tables_for_type(entity_type) {
            let Some(schema) = ctx.catalog.schema(table) else {
                continue;
            };
            let Some(source) = schema.source_column.as_deref() else {
                continue;
            };
            let physical = ctx.physical(schema, layer);
            let own: Filter = vec![(source.to_string(), SqlValue::text(key))];
            let rows = ctx.store.select_rows(schema, &physical, &own)?;
            if rows.is_empty() {
                continue;
            }
            for row in &rows {
                plan_dependents(ctx, table, row, layer, depth, &mut visited, steps)?;
            }
            if depth == CascadeDepth::Full {
                steps.push(DeleteStep {
                    table: physical,
                    filter: own,
                });
            }
        }
        Ok(())
    }

    fn plan_key(
        &self,
        ctx: &StageContext<'_>,
        key: &str,
        deleted: bool,
        important: bool,
    ) -> Result<DeletePlan> {
        let mut steps = Vec::new();
        let id = Uuid::parse_str(key).ok();
        let key = canonical_key(key);
        let entity_type = match id {
            Some(id) => ctx.store.entity_type_of(id)?,
            None => None,
        };

        if let (Some(entity_type), true) = (entity_type.as_deref(), deleted || important) {
            self.plan_layer(ctx, entity_type, &key, TableLayer::Shadow, CascadeDepth::Full, &mut steps)?;
            let real_depth = if deleted {
                CascadeDepth::Full
            } else {
                CascadeDepth::Memberships
            };
            self.plan_layer(ctx, entity_type, &key, TableLayer::Real, real_depth, &mut steps)?;
        }

        let raw: Filter = vec![("entity_id".to_string(), SqlValue::text(key.as_str()))];
        steps.push(DeleteStep {
            table: "raw_fields".to_string(),
            filter: raw.clone(),
        });
        if deleted || important {
            steps.push(DeleteStep {
                table: "raw_records".to_string(),
                filter: raw,
            });
        }
        Ok(DeletePlan { key, steps })
    }
}

impl Default for InvalidationCascade {
    fn default() -> Self {
        Self::new()
    }
}

impl StageHandler for InvalidationCascade {
    fn stage(&self) -> Stage {
        Stage::Invalidate
    }

    fn can_skip(&self, ctx: &StageContext<'_>) -> bool {
        ctx.job.diff.deleted.is_empty() && ctx.job.diff.modified.is_empty()
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageReport> {
        let start = Instant::now();
        let mut report = StageReport::new(Stage::Invalidate);
        let diff = &ctx.job.diff;
        let invalidated = diff.invalidated();
        let unimportant = diff.modified_unimportant();
        info!(
            "Invalidating {} keys ({} deleted), clearing fields of {} more",
            invalidated.len(),
            diff.deleted.len(),
            unimportant.len()
        );

        let mut writer = BatchWriter::new(ctx.store.delete_plan_sink(), WriteMode::Insert);
        let keys = invalidated.iter().chain(unimportant.iter());
        for key in keys {
            let deleted = diff.deleted.contains(key);
            let important = diff.modified_important.contains(key);
            match self.plan_key(ctx, key, deleted, important) {
                Ok(plan) => {
                    debug!("{}: {} delete steps", key, plan.steps.len());
                    writer.add(plan);
                    report.ingested += 1;
                }
                Err(e) => {
                    // best effort per key
                    warn!("Invalidation of {} failed: {}", key, e);
                    report.failed_write += 1;
                }
            }
            writer.flush(ctx.config.batch_size)?;
        }
        let stats = writer.finish()?;
        let failed_keys: HashSet<String> = stats.failures.iter().map(|f| f.key.clone()).collect();
        let rows_deleted = report.absorb_write(stats);
        report.ingested = report.ingested.saturating_sub(failed_keys.len());

        // error marks belong to the previous payload
        for key in invalidated.iter().map(|k| canonical_key(k)) {
            if !failed_keys.contains(&key) {
                ctx.store.clear_key(&key)?;
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Invalidated {} keys, {} rows deleted in {}ms ({} failed)",
            report.ingested, rows_deleted, report.duration_ms, report.failed_write
        );
        Ok(report)
    }
}
