//! Row reservations for concurrent workers.
//!
//! A reservation is claimed inside an immediate transaction, so two stores
//! on the same database file never both observe a free slot.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use std::time::Duration;
use tracing::debug;

use super::SqliteStore;
use crate::domain::{Reservation, ReservationStatus, ReservationStore, ReserveOutcome};
use crate::{Result, StorageError};

fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl ReservationStore for SqliteStore {
    fn reserve(
        &self,
        table: &str,
        key: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<ReserveOutcome> {
        let now = Utc::now().timestamp();
        let stale_before = now - timeout.as_secs() as i64;

        self.with_immediate_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO reservations (table_name, key, worker_id, reserved_at, status)
                 VALUES (?1, ?2, ?3, ?4, 'reserved')",
                params![table, key, worker_id, now],
            )?;
            if inserted > 0 {
                return Ok(ReserveOutcome::Acquired);
            }

            let (holder, reserved_at, status, message): (String, i64, String, Option<String>) = tx
                .query_row(
                    "SELECT worker_id, reserved_at, status, message FROM reservations
                     WHERE table_name = ?1 AND key = ?2",
                    params![table, key],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )?;

            match ReservationStatus::parse(&status) {
                Some(ReservationStatus::Error) => Ok(ReserveOutcome::Errored { message }),
                Some(ReservationStatus::Reserved) if holder == worker_id => {
                    Ok(ReserveOutcome::Acquired)
                }
                Some(ReservationStatus::Reserved) if reserved_at < stale_before => {
                    debug!(table, key, previous = %holder, "Taking over stale reservation");
                    tx.execute(
                        "UPDATE reservations SET worker_id = ?3, reserved_at = ?4
                         WHERE table_name = ?1 AND key = ?2",
                        params![table, key, worker_id, now],
                    )?;
                    Ok(ReserveOutcome::Acquired)
                }
                Some(ReservationStatus::Reserved) => {
                    Ok(ReserveOutcome::HeldByOther { worker_id: holder })
                }
                None => Err(StorageError::serialization(format!(
                    "Unknown reservation status '{}' for {}/{}",
                    status, table, key
                ))),
            }
        })
    }

    fn release(&self, table: &str, keys: &[String], worker_id: &str) -> Result<usize> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM reservations
                 WHERE table_name = ?1 AND key = ?2 AND worker_id = ?3 AND status = 'reserved'",
            )?;
            let mut released = 0;
            for key in keys {
                released += stmt.execute(params![table, key, worker_id])?;
            }
            Ok(released)
        })
    }

    fn mark_error(&self, table: &str, key: &str, worker_id: &str, message: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO reservations
                    (table_name, key, worker_id, reserved_at, status, message)
                 VALUES (?1, ?2, ?3, ?4, 'error', ?5)",
                params![table, key, worker_id, Utc::now().timestamp(), message],
            )?;
            Ok(())
        })
    }

    fn clear_key(&self, key: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM reservations WHERE key = ?1 OR key LIKE ?1 || '|%'",
                [key],
            )?)
        })
    }

    fn reservation(&self, table: &str, key: &str) -> Result<Option<Reservation>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT table_name, key, worker_id, reserved_at, status, message
                     FROM reservations WHERE table_name = ?1 AND key = ?2",
                    params![table, key],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, i64>(3)?,
                            r.get::<_, String>(4)?,
                            r.get::<_, Option<String>>(5)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        row.map(|(table_name, key, worker_id, reserved_at, status, message)| {
            let status = ReservationStatus::parse(&status).ok_or_else(|| {
                StorageError::serialization(format!("Unknown reservation status '{}'", status))
            })?;
            Ok(Reservation {
                table_name,
                key,
                worker_id,
                reserved_at: from_epoch(reserved_at),
                status,
                message,
            })
        })
        .transpose()
    }
}
