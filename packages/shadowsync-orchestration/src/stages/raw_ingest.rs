use shadowsync_storage::{normalize_fields, BatchWriter, RawField, RawRecord, WriteMode};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EntityError, Result};
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageReport};

/// Which diff keys a raw ingestion pass writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestScope {
    /// `created` keys (ingest-raw)
    Created,
    /// `modified` keys, after the cascade cleared them (re-ingest-raw)
    Modified,
}

/// Raw ingestion: snapshot records → `raw_records` / `raw_fields`
///
/// Runs in skip-existing mode, so a repeated pass over the same keys writes
/// nothing new.
pub struct RawIngestStage {
    scope: IngestScope,
}

impl RawIngestStage {
    pub fn new(scope: IngestScope) -> Self {
        Self { scope }
    }

    pub fn created() -> Self {
        Self::new(IngestScope::Created)
    }

    pub fn modified() -> Self {
        Self::new(IngestScope::Modified)
    }

    fn keys<'c>(&self, ctx: &'c StageContext<'_>) -> &'c BTreeSet<String> {
        match self.scope {
            IngestScope::Created => &ctx.job.diff.created,
            IngestScope::Modified => &ctx.job.diff.modified,
        }
    }
}

impl StageHandler for RawIngestStage {
    fn stage(&self) -> Stage {
        match self.scope {
            IngestScope::Created => Stage::IngestRaw,
            IngestScope::Modified => Stage::ReIngestRaw,
        }
    }

    fn can_skip(&self, ctx: &StageContext<'_>) -> bool {
        self.keys(ctx).is_empty()
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageReport> {
        let start = Instant::now();
        let mut report = StageReport::new(self.stage());
        let keys = self.keys(ctx);
        let batch_size = ctx.config.batch_size;
        let options = ctx.config.normalize_options();
        info!("{}: writing {} entities", self.stage(), keys.len());

        let mut records = BatchWriter::new(ctx.store.raw_record_sink(), WriteMode::SkipExisting);
        let mut fields = BatchWriter::new(ctx.store.raw_field_sink(), WriteMode::SkipExisting);

        for key in keys {
            let Some(record) = ctx.snapshot.get(key) else {
                // the job was recorded from another snapshot of the same day
                report.record_entity_error(
                    "raw_records",
                    key,
                    &EntityError::integrity("key not present in the loaded snapshot"),
                );
                continue;
            };
            let entity_id = match Uuid::parse_str(&record.pk) {
                Ok(id) => id,
                Err(e) => {
                    report.record_entity_error(
                        "raw_records",
                        key,
                        &EntityError::integrity(format!("primary key is not a UUID: {}", e)),
                    );
                    continue;
                }
            };

            let normalized = normalize_fields(&record.fields, &options);
            for name in &normalized.dropped {
                warn!(
                    "Entity {}: field '{}' exceeds {} bytes, dropped",
                    entity_id, name, options.max_field_bytes
                );
            }

            records.add(RawRecord::new(entity_id, record.entity_type.clone()));
            for (name, values) in &normalized.fields {
                for field in RawField::rows_for(entity_id, name, values) {
                    fields.add(field);
                }
            }
            report.ingested += 1;

            // records must land before the fields referencing them
            if fields.pending() >= batch_size || records.pending() >= batch_size {
                records.flush_all()?;
                fields.flush_all()?;
            }
        }

        let record_stats = records.finish()?;
        let field_stats = fields.finish()?;
        let failed_records = record_stats.failed;
        report.absorb_write(record_stats);
        report.absorb_write(field_stats);
        if failed_records > 0 {
            report.ingested = report.ingested.saturating_sub(failed_records);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "{}: {} entities in {}ms ({} skipped, {} failed writes)",
            self.stage(),
            report.ingested,
            report.duration_ms,
            report.skipped(),
            report.failed_write
        );
        Ok(report)
    }
}
