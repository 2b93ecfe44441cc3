//! Raw record/field persistence.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::SqliteStore;
use crate::batch::{BatchSink, WriteMode, WriteStats};
use crate::domain::{FieldValue, RawEntity, RawField, RawRecord, RawStore};
use crate::{Result, StorageError};

const IN_CHUNK: usize = 500;

/// Bulk sink for `raw_records`
pub struct RawRecordSink {
    store: SqliteStore,
}

impl BatchSink for RawRecordSink {
    type Item = RawRecord;

    fn target(&self) -> &str {
        "raw_records"
    }

    fn describe(&self, item: &RawRecord) -> String {
        item.entity_id.to_string()
    }

    fn write_batch(&self, items: &[RawRecord], mode: WriteMode) -> Result<usize> {
        let sql = format!(
            "{} INTO raw_records (entity_id, entity_type) VALUES (?1, ?2)",
            mode.insert_verb()
        );
        self.store.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(&sql)?;
            let mut written = 0;
            for record in items {
                written += stmt.execute(params![record.entity_id.to_string(), record.entity_type])?;
            }
            Ok(written)
        })
    }
}

/// Bulk sink for `raw_fields`
pub struct RawFieldSink {
    store: SqliteStore,
}

impl BatchSink for RawFieldSink {
    type Item = RawField;

    fn target(&self) -> &str {
        "raw_fields"
    }

    fn describe(&self, item: &RawField) -> String {
        format!("{}.{}[{}]", item.entity_id, item.field_name, item.value_index)
    }

    fn write_batch(&self, items: &[RawField], mode: WriteMode) -> Result<usize> {
        let sql = format!(
            "{} INTO raw_fields (entity_id, field_name, value_index, field_value)
             VALUES (?1, ?2, ?3, ?4)",
            mode.insert_verb()
        );
        self.store.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(&sql)?;
            let mut written = 0;
            for field in items {
                written += stmt.execute(params![
                    field.entity_id.to_string(),
                    field.field_name,
                    field.value_index,
                    field.field_value
                ])?;
            }
            Ok(written)
        })
    }
}

impl SqliteStore {
    pub fn raw_record_sink(&self) -> RawRecordSink {
        RawRecordSink {
            store: self.clone(),
        }
    }

    pub fn raw_field_sink(&self) -> RawFieldSink {
        RawFieldSink {
            store: self.clone(),
        }
    }

    /// Ids of every raw record of one type, sorted
    pub fn entity_ids_of_type(&self, entity_type: &str) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entity_id FROM raw_records WHERE entity_type = ?1 ORDER BY entity_id",
            )?;
            let ids = stmt
                .query_map([entity_type], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            parse_ids(ids)
        })
    }

    /// Raw records of `entity_type` with no row in `table` whose
    /// `source_column` holds their id.
    pub fn unresolved_entities(
        &self,
        entity_type: &str,
        table: &str,
        source_column: &str,
    ) -> Result<Vec<Uuid>> {
        let sql = format!(
            "SELECT r.entity_id FROM raw_records r
             WHERE r.entity_type = ?1
               AND NOT EXISTS (SELECT 1 FROM {t} s WHERE s.{c} = r.entity_id)
             ORDER BY r.entity_id",
            t = super::quote_ident(table),
            c = super::quote_ident(source_column),
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map([entity_type], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            parse_ids(ids)
        })
    }

    /// Load several entities; ids without a record are skipped.
    pub fn load_entities(&self, ids: &[Uuid]) -> Result<Vec<RawEntity>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let keys: Vec<String> = chunk.iter().map(Uuid::to_string).collect();
            let entities = self.with_conn(|conn| {
                load_where(
                    conn,
                    &format!("r.entity_id IN ({})", placeholders),
                    rusqlite::params_from_iter(keys.iter()),
                )
            })?;
            out.extend(entities);
        }
        Ok(out)
    }

    /// Every raw entity, ordered by id. Used to rebuild the last-known state.
    pub fn load_all_entities(&self) -> Result<Vec<RawEntity>> {
        self.with_conn(|conn| load_where(conn, "1 = 1", []))
    }
}

fn parse_ids(ids: Vec<String>) -> Result<Vec<Uuid>> {
    ids.iter()
        .map(|s| Uuid::parse_str(s).map_err(StorageError::from))
        .collect()
}

fn load_where<P: rusqlite::Params>(
    conn: &Connection,
    predicate: &str,
    params: P,
) -> Result<Vec<RawEntity>> {
    let sql = format!(
        "SELECT r.entity_id, r.entity_type, f.field_name, f.field_value
         FROM raw_records r
         LEFT JOIN raw_fields f ON f.entity_id = r.entity_id
         WHERE {}
         ORDER BY r.entity_id, f.field_name, f.value_index",
        predicate
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut entities: Vec<RawEntity> = Vec::new();
    for (id, entity_type, field_name, field_value) in rows {
        let entity_id = Uuid::parse_str(&id)?;
        let is_new = entities
            .last()
            .map_or(true, |last| last.record.entity_id != entity_id);
        if is_new {
            entities.push(RawEntity::new(RawRecord::new(entity_id, entity_type)));
        }
        if let (Some(entity), Some(name)) = (entities.last_mut(), field_name) {
            entity.fields.entry(name).or_default().push(field_value);
        }
    }
    Ok(entities)
}

impl RawStore for SqliteStore {
    fn upsert_entity(&self, entity_id: Uuid, entity_type: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO raw_records (entity_id, entity_type) VALUES (?1, ?2)",
                params![entity_id.to_string(), entity_type],
            )?;
            Ok(())
        })
    }

    fn upsert_fields(
        &self,
        entity_id: Uuid,
        fields: &BTreeMap<String, Vec<String>>,
    ) -> Result<WriteStats> {
        let id = entity_id.to_string();
        let written = self.with_immediate_tx(|tx| {
            let mut delete = tx.prepare_cached(
                "DELETE FROM raw_fields WHERE entity_id = ?1 AND field_name = ?2",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO raw_fields (entity_id, field_name, value_index, field_value)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut written = 0;
            for (name, values) in fields {
                delete.execute(params![id, name])?;
                for field in RawField::rows_for(entity_id, name, values) {
                    written += insert.execute(params![
                        id,
                        field.field_name,
                        field.value_index,
                        field.field_value
                    ])?;
                }
            }
            Ok(written)
        })?;
        Ok(WriteStats {
            written,
            ..Default::default()
        })
    }

    fn delete_entity(&self, entity_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM raw_records WHERE entity_id = ?1",
                [entity_id.to_string()],
            )?;
            Ok(n > 0)
        })
    }

    fn delete_fields(&self, entity_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM raw_fields WHERE entity_id = ?1",
                [entity_id.to_string()],
            )?)
        })
    }

    fn get_field(
        &self,
        entity_id: Uuid,
        field_name: &str,
        default: Option<FieldValue>,
    ) -> Result<FieldValue> {
        let values = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT field_value FROM raw_fields
                 WHERE entity_id = ?1 AND field_name = ?2
                 ORDER BY value_index",
            )?;
            let values = stmt
                .query_map(params![entity_id.to_string(), field_name], |row| {
                    row.get::<_, Option<String>>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(values)
        })?;

        if values.is_empty() {
            return default.ok_or_else(|| StorageError::field_not_found(entity_id, field_name));
        }
        Ok(FieldValue::from_values(values))
    }

    fn load_entity(&self, entity_id: Uuid) -> Result<Option<RawEntity>> {
        let key = entity_id.to_string();
        let mut entities =
            self.with_conn(|conn| load_where(conn, "r.entity_id = ?1", [key.as_str()]))?;
        Ok(entities.pop())
    }

    fn entity_type_of(&self, entity_id: Uuid) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT entity_type FROM raw_records WHERE entity_id = ?1",
                    [entity_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn count_entities(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM raw_records", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }
}
