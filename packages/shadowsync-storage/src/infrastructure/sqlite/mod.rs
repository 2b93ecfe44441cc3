//! SQLite adapter
//!
//! One [`SqliteStore`] owns one connection. Several stores (in one or several
//! processes) may open the same database file; WAL mode plus a busy timeout
//! lets them interleave, and the reservation table arbitrates row ownership.
//!
//! Fixed tables:
//! - `raw_records`, `raw_fields` (cascade on delete)
//! - `jobs`, `task_status`
//! - `reservations`
//!
//! Shadow, membership and real tables are created from [`TableSchema`]s.
//!
//! [`TableSchema`]: crate::domain::TableSchema

mod ledger;
mod raw;
mod reservation;
mod tables;

pub use raw::{RawFieldSink, RawRecordSink};
pub use tables::{DeletePlanSink, MembershipJoinStats, RowUpdateSink, TableRowSink};

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed raw store, table store, ledger and reservation store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        debug!(path = %db_path.as_ref().display(), "Opened SQLite store");
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS raw_records (
                entity_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_raw_records_type
                ON raw_records(entity_type);

            CREATE TABLE IF NOT EXISTS raw_fields (
                entity_id TEXT NOT NULL,
                field_name TEXT NOT NULL,
                value_index INTEGER NOT NULL,
                field_value TEXT,
                PRIMARY KEY (entity_id, field_name, value_index),
                FOREIGN KEY (entity_id) REFERENCES raw_records(entity_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_raw_fields_name_value
                ON raw_fields(field_name, field_value);",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_date TEXT NOT NULL,
                timezone TEXT NOT NULL,
                current_snapshot_ts TEXT NOT NULL,
                previous_snapshot_ts TEXT,
                created_pks TEXT NOT NULL,
                modified_pks TEXT NOT NULL,
                deleted_pks TEXT NOT NULL,
                modified_pks_important TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (job_date, timezone)
            );

            CREATE TABLE IF NOT EXISTS task_status (
                job_id INTEGER NOT NULL,
                task_name TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                PRIMARY KEY (job_id, task_name),
                FOREIGN KEY (job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
            );",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reservations (
                table_name TEXT NOT NULL,
                key TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                reserved_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                PRIMARY KEY (table_name, key)
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_key
                ON reservations(key);",
        )?;

        Ok(())
    }

    /// Run `f` against the connection
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction; rolled back if `f` fails
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Like [`Self::with_tx`] but takes the write lock up front
    pub(crate) fn with_immediate_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// Double-quote an identifier for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let store = SqliteStore::in_memory().unwrap();
        let enabled: i64 = store
            .with_conn(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_file_store_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("sync.db")).unwrap();
        let mode: String = store
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("shadow_session"), "\"shadow_session\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
