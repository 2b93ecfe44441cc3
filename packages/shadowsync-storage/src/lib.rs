//! shadowsync storage layer
//!
//! Persistence for the incremental synchronization engine:
//!
//! 1. **RawStore**: attribute-value mirror of upstream entities
//!    (`raw_records` / `raw_fields`, `"None"` sentinel for explicit empties)
//! 2. **Derived tables**: shadow, membership and real tables created from
//!    [`TableSchema`] definitions
//! 3. **BatchWriter**: the only path for bulk writes; isolates failing rows
//! 4. **Ledger**: jobs, per-stage task timings, row reservations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shadowsync_storage::{BatchWriter, RawStore, SqliteStore, WriteMode};
//!
//! let store = SqliteStore::open("sync.db")?;
//! store.upsert_entity(id, "session")?;
//!
//! let mut writer = BatchWriter::new(store.raw_field_sink(), WriteMode::SkipExisting);
//! for field in fields {
//!     writer.add(field);
//!     writer.flush(1000)?;
//! }
//! let stats = writer.finish()?;
//! ```

pub mod batch;
pub mod domain;
pub mod error;
pub mod normalize;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use batch::{BatchSink, BatchWriter, RowFailure, WriteMode, WriteStats};
pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    key_string, ColumnDef, ColumnType, DeletePlan, DeleteStep, DiffResult, FieldValue, Filter,
    ForeignKey, JobEntry, JoinColumn, JoinSide, LedgerStore, MembershipJoin, NewJob, RawEntity,
    RawField, RawRecord, RawStore, Reservation, ReservationStatus, ReservationStore,
    ReserveOutcome, Row, RowUpdate, SqlValue, TableKind, TableLayer, TableSchema, TaskStatus,
    NONE_SENTINEL,
};
pub use normalize::{normalize_fields, normalize_value, NormalizeOptions, NormalizedFields};

#[cfg(feature = "sqlite")]
pub use infrastructure::sqlite::{MembershipJoinStats, SqliteStore};
