//! Port traits implemented by storage adapters.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::ledger::{JobEntry, NewJob, Reservation, ReserveOutcome, TaskStatus};
use super::raw::{FieldValue, RawEntity};
use crate::batch::WriteStats;
use crate::Result;

/// Attribute-value mirror of upstream entities.
///
/// Bulk paths go through [`crate::BatchWriter`]; these single-entity
/// operations exist for targeted access and small corrections.
pub trait RawStore {
    /// Insert the record if absent. Records are never mutated in place.
    fn upsert_entity(&self, entity_id: Uuid, entity_type: &str) -> Result<()>;

    /// Replace the named fields with the given normalized values, all or
    /// nothing.
    fn upsert_fields(
        &self,
        entity_id: Uuid,
        fields: &BTreeMap<String, Vec<String>>,
    ) -> Result<WriteStats>;

    /// Delete the record and, through the cascade, all of its fields.
    fn delete_entity(&self, entity_id: Uuid) -> Result<bool>;

    /// Delete every field of the entity, keeping the record.
    fn delete_fields(&self, entity_id: Uuid) -> Result<usize>;

    /// Field value; `default` is returned when the field is absent, else `NotFound`.
    fn get_field(
        &self,
        entity_id: Uuid,
        field_name: &str,
        default: Option<FieldValue>,
    ) -> Result<FieldValue>;

    fn load_entity(&self, entity_id: Uuid) -> Result<Option<RawEntity>>;

    fn entity_type_of(&self, entity_id: Uuid) -> Result<Option<String>>;

    fn count_entities(&self) -> Result<usize>;
}

/// Persistence for jobs and their stage timings.
pub trait LedgerStore {
    /// Insert unless `(job_date, timezone)` exists; returns the stored entry
    /// and whether it was newly created.
    fn insert_job_if_absent(&self, job: &NewJob) -> Result<(JobEntry, bool)>;

    fn find_job(&self, job_date: NaiveDate, timezone: &str) -> Result<Option<JobEntry>>;

    fn latest_job(&self) -> Result<Option<JobEntry>>;

    /// Whether any recorded job lists `key` among its deleted keys.
    fn was_deleted(&self, key: &str) -> Result<bool>;

    /// Append a stage timing; a second record for the same stage is ignored.
    fn record_task(&self, task: &TaskStatus) -> Result<bool>;

    fn tasks_for_job(&self, job_id: i64) -> Result<Vec<TaskStatus>>;
}

/// Per-row claims shared by concurrent workers.
pub trait ReservationStore {
    /// Claim `(table, key)`. Reservations older than `timeout` are taken over.
    fn reserve(
        &self,
        table: &str,
        key: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<ReserveOutcome>;

    /// Drop this worker's live reservations on the given keys.
    fn release(&self, table: &str, keys: &[String], worker_id: &str) -> Result<usize>;

    /// Record a permanent failure so other workers skip the row too.
    fn mark_error(&self, table: &str, key: &str, worker_id: &str, message: &str) -> Result<()>;

    /// Remove all reservations, including errors, for an entity key.
    fn clear_key(&self, key: &str) -> Result<usize>;

    fn reservation(&self, table: &str, key: &str) -> Result<Option<Reservation>>;
}
