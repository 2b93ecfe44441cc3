//! Domain layer
//!
//! # Models
//!
//! - `RawRecord` / `RawField`: attribute-value mirror of upstream entities
//! - `TableSchema`: typed shadow/membership/real table definitions
//! - `DiffResult`, `JobEntry`, `TaskStatus`: run audit trail
//! - `Reservation`: per-row claims between concurrent workers
//!
//! # Ports
//!
//! - `RawStore`, `LedgerStore`, `ReservationStore`

pub mod ledger;
pub mod ports;
pub mod raw;
pub mod table;

pub use ledger::{
    DiffResult, JobEntry, NewJob, Reservation, ReservationStatus, ReserveOutcome, TaskStatus,
};
pub use ports::{LedgerStore, RawStore, ReservationStore};
pub use raw::{FieldValue, RawEntity, RawField, RawRecord, NONE_SENTINEL};
pub use table::{
    key_string, validate_identifier, ColumnDef, ColumnType, DeletePlan, DeleteStep, Filter,
    ForeignKey, JoinColumn, JoinSide, MembershipJoin, Row, RowUpdate, SqlValue, TableKind,
    TableLayer, TableSchema,
};
