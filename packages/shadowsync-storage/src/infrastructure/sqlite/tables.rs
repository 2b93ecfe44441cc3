//! Dynamic shadow/membership/real tables.

use rusqlite::{params_from_iter, Connection, OptionalExtension, ToSql};
use serde::Serialize;
use tracing::debug;

use super::{quote_ident, SqliteStore};
use crate::batch::{BatchSink, WriteMode};
use crate::domain::{
    key_string, DeletePlan, Filter, JoinSide, MembershipJoin, Row, RowUpdate, SqlValue,
    TableSchema,
};
use crate::{Result, StorageError};

/// Bulk insert sink for one physical table
pub struct TableRowSink {
    store: SqliteStore,
    table: String,
    columns: Vec<String>,
    key_columns: Vec<String>,
}

impl BatchSink for TableRowSink {
    type Item = Row;

    fn target(&self) -> &str {
        &self.table
    }

    fn describe(&self, row: &Row) -> String {
        let key: Vec<SqlValue> = self
            .key_columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(SqlValue::Null))
            .collect();
        key_string(&key)
    }

    fn write_batch(&self, rows: &[Row], mode: WriteMode) -> Result<usize> {
        let sql = format!(
            "{} INTO {} ({}) VALUES ({})",
            mode.insert_verb(),
            quote_ident(&self.table),
            self.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=self.columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.store.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(&sql)?;
            let mut written = 0;
            for row in rows {
                let values = self
                    .columns
                    .iter()
                    .map(|c| row.get(c).unwrap_or(&SqlValue::Null));
                written += stmt.execute(params_from_iter(values))?;
            }
            Ok(written)
        })
    }
}

/// Field-level updates against one physical table
pub struct RowUpdateSink {
    store: SqliteStore,
    table: String,
}

impl BatchSink for RowUpdateSink {
    type Item = RowUpdate;

    fn target(&self) -> &str {
        &self.table
    }

    fn describe(&self, update: &RowUpdate) -> String {
        let key: Vec<SqlValue> = update.key.iter().map(|(_, v)| v.clone()).collect();
        key_string(&key)
    }

    fn write_batch(&self, updates: &[RowUpdate], _mode: WriteMode) -> Result<usize> {
        self.store.with_tx(|tx| {
            let mut written = 0;
            for update in updates {
                if update.changes.is_empty() {
                    continue;
                }
                let set_clause = update
                    .changes
                    .iter()
                    .enumerate()
                    .map(|(i, (col, _))| format!("{} = ?{}", quote_ident(col), i + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                let (key_clause, key_params) = where_clause(&update.key, update.changes.len());
                let sql = format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote_ident(&self.table),
                    set_clause,
                    key_clause
                );
                let mut params: Vec<&dyn ToSql> =
                    update.changes.iter().map(|(_, v)| v as &dyn ToSql).collect();
                params.extend(key_params);
                written += tx.prepare_cached(&sql)?.execute(params.as_slice())?;
            }
            Ok(written)
        })
    }
}

/// Executes one [`DeletePlan`] per item; a batch shares one transaction.
pub struct DeletePlanSink {
    store: SqliteStore,
}

impl BatchSink for DeletePlanSink {
    type Item = DeletePlan;

    fn target(&self) -> &str {
        "invalidation"
    }

    fn describe(&self, plan: &DeletePlan) -> String {
        plan.key.clone()
    }

    fn write_batch(&self, plans: &[DeletePlan], _mode: WriteMode) -> Result<usize> {
        self.store.with_tx(|tx| {
            let mut deleted = 0;
            for plan in plans {
                for step in &plan.steps {
                    deleted += delete_where(tx, &step.table, &step.filter)?;
                }
            }
            Ok(deleted)
        })
    }
}

/// Counts from one set-oriented membership join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MembershipJoinStats {
    /// Non-empty values of the source field
    pub candidates: usize,
    /// Candidates whose parent and other rows both exist
    pub resolvable: usize,
    /// Rows newly inserted
    pub inserted: usize,
}

/// `col = ?n AND ...` with `IS NULL` for null values; parameters numbered
/// after `offset`.
fn where_clause(filter: &Filter, offset: usize) -> (String, Vec<&dyn ToSql>) {
    if filter.is_empty() {
        return ("1 = 1".to_string(), Vec::new());
    }
    let mut parts = Vec::with_capacity(filter.len());
    let mut params: Vec<&dyn ToSql> = Vec::new();
    for (col, value) in filter {
        if value.is_null() {
            parts.push(format!("{} IS NULL", quote_ident(col)));
        } else {
            params.push(value as &dyn ToSql);
            parts.push(format!("{} = ?{}", quote_ident(col), offset + params.len()));
        }
    }
    (parts.join(" AND "), params)
}

fn delete_where(conn: &Connection, table: &str, filter: &Filter) -> Result<usize> {
    if filter.is_empty() {
        return Err(StorageError::config(format!(
            "Refusing unfiltered delete on '{}'",
            table
        )));
    }
    let (clause, params) = where_clause(filter, 0);
    let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), clause);
    Ok(conn.prepare_cached(&sql)?.execute(params.as_slice())?)
}

fn read_rows(conn: &Connection, sql: &str, params: &[&dyn ToSql], columns: &[&str]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, |r| {
            let mut row = Row::new();
            for (i, col) in columns.iter().enumerate() {
                row.insert(col.to_string(), r.get::<_, SqlValue>(i)?);
            }
            Ok(row)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

impl SqliteStore {
    /// Create `physical` from `schema` if it does not exist, with indexes on
    /// the source column and foreign-key columns.
    pub fn create_table(&self, schema: &TableSchema, physical: &str) -> Result<()> {
        schema.validate()?;

        let mut defs: Vec<String> = schema
            .columns
            .iter()
            .map(|c| {
                format!(
                    "{} {}{}",
                    quote_ident(&c.name),
                    c.column_type.sql_type(),
                    if c.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();
        defs.push(format!(
            "PRIMARY KEY ({})",
            schema
                .primary_key
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        ));

        let mut index_columns: Vec<Vec<String>> = Vec::new();
        if let Some(source) = &schema.source_column {
            index_columns.push(vec![source.clone()]);
        }
        for fk in &schema.foreign_keys {
            index_columns.push(fk.columns.clone());
        }

        self.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote_ident(physical),
                defs.join(", ")
            ))?;
            for cols in &index_columns {
                let index_name = format!("idx_{}_{}", physical, cols.join("_"));
                conn.execute_batch(&format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&index_name),
                    quote_ident(physical),
                    cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
                ))?;
            }
            Ok(())
        })?;
        debug!(table = physical, "Ensured table exists");
        Ok(())
    }

    pub fn table_row_sink(&self, schema: &TableSchema, physical: &str) -> TableRowSink {
        TableRowSink {
            store: self.clone(),
            table: physical.to_string(),
            columns: schema.columns.iter().map(|c| c.name.clone()).collect(),
            key_columns: schema.primary_key.clone(),
        }
    }

    pub fn row_update_sink(&self, physical: &str) -> RowUpdateSink {
        RowUpdateSink {
            store: self.clone(),
            table: physical.to_string(),
        }
    }

    pub fn delete_plan_sink(&self) -> DeletePlanSink {
        DeletePlanSink {
            store: self.clone(),
        }
    }

    /// Rows of `physical` matching `filter` (all rows when empty), in key order.
    pub fn select_rows(&self, schema: &TableSchema, physical: &str, filter: &Filter) -> Result<Vec<Row>> {
        let columns = schema.column_names();
        let (clause, params) = where_clause(filter, 0);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {}",
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            quote_ident(physical),
            clause,
            order_by(schema, None)
        );
        self.with_conn(|conn| read_rows(conn, &sql, &params, &columns))
    }

    /// Rows of `source` whose primary key is absent from `target`.
    pub fn rows_missing_from(&self, schema: &TableSchema, source: &str, target: &str) -> Result<Vec<Row>> {
        let columns = schema.column_names();
        let key_match = schema
            .primary_key
            .iter()
            .map(|c| format!("t.{c} = s.{c}", c = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {} FROM {} s WHERE NOT EXISTS (SELECT 1 FROM {} t WHERE {}) ORDER BY {}",
            columns
                .iter()
                .map(|c| format!("s.{}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", "),
            quote_ident(source),
            quote_ident(target),
            key_match,
            order_by(schema, Some("s"))
        );
        self.with_conn(|conn| read_rows(conn, &sql, &[], &columns))
    }

    /// `(source row, target row)` pairs of the same entity (matched on the
    /// source column) that differ in any column, in source key order.
    pub fn diverged_rows(
        &self,
        schema: &TableSchema,
        source: &str,
        target: &str,
    ) -> Result<Vec<(Row, Row)>> {
        let entity_column = schema.source_column.as_deref().ok_or_else(|| {
            StorageError::config(format!("Table '{}' has no source column", schema.name))
        })?;
        let columns = schema.column_names();
        let select = ["s", "t"]
            .iter()
            .flat_map(|alias| {
                columns
                    .iter()
                    .map(move |c| format!("{}.{}", alias, quote_ident(c)))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let differs = columns
            .iter()
            .map(|c| format!("s.{c} IS NOT t.{c}", c = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT {} FROM {} s JOIN {} t ON t.{e} = s.{e} WHERE {} ORDER BY {}",
            select,
            quote_ident(source),
            quote_ident(target),
            differs,
            order_by(schema, Some("s")),
            e = quote_ident(entity_column),
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let width = columns.len();
            let pairs = stmt
                .query_map([], |r| {
                    let mut ours = Row::new();
                    let mut theirs = Row::new();
                    for (i, col) in columns.iter().enumerate() {
                        ours.insert(col.to_string(), r.get::<_, SqlValue>(i)?);
                        theirs.insert(col.to_string(), r.get::<_, SqlValue>(width + i)?);
                    }
                    Ok((ours, theirs))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pairs)
        })
    }

    pub fn count_rows(&self, physical: &str) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(physical));
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(&sql, [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }

    /// SQLite rowid of the row matching `filter`, if any.
    pub fn rowid_of(&self, physical: &str, filter: &Filter) -> Result<Option<i64>> {
        let (clause, params) = where_clause(filter, 0);
        let sql = format!("SELECT rowid FROM {} WHERE {}", quote_ident(physical), clause);
        self.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, params.as_slice(), |r| r.get(0))
                .optional()?)
        })
    }

    /// Populate a membership table with one set-oriented statement.
    ///
    /// Fails with `TransientWrite` when the candidate count exceeds `limit`,
    /// leaving the table untouched.
    pub fn membership_join(
        &self,
        join: &MembershipJoin,
        limit: usize,
        mode: WriteMode,
    ) -> Result<MembershipJoinStats> {
        let from = "FROM raw_fields f
             JOIN raw_records r ON r.entity_id = f.entity_id
             WHERE r.entity_type = ?1 AND f.field_name = ?2
               AND f.field_value IS NOT NULL AND f.field_value != 'None'";
        let joined = format!(
            "FROM raw_fields f
             JOIN raw_records r ON r.entity_id = f.entity_id
             JOIN {p} p ON p.{ps} = f.entity_id
             JOIN {o} o ON o.{om} = {value}
             WHERE r.entity_type = ?1 AND f.field_name = ?2",
            p = quote_ident(&join.parent_table),
            ps = quote_ident(&join.parent_source_column),
            o = quote_ident(&join.other_table),
            om = quote_ident(&join.other_match_column),
            value = if join.match_uuid {
                "lower(f.field_value)"
            } else {
                "f.field_value"
            },
        );
        let target_cols = join
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let select_cols = join
            .columns
            .iter()
            .map(|c| {
                let alias = match c.side {
                    JoinSide::Parent => "p",
                    JoinSide::Other => "o",
                };
                format!("{}.{}", alias, quote_ident(&c.column))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "{} INTO {} ({}) SELECT DISTINCT {} {}",
            mode.insert_verb(),
            quote_ident(&join.target),
            target_cols,
            select_cols,
            joined
        );

        let params = [join.parent_type.as_str(), join.field_name.as_str()];
        self.with_tx(|tx| {
            let candidates: i64 =
                tx.query_row(&format!("SELECT COUNT(*) {}", from), params, |r| r.get(0))?;
            let candidates = candidates as usize;
            if candidates > limit {
                return Err(StorageError::transient_write(format!(
                    "Membership join into '{}' has {} candidate pairs (limit {})",
                    join.target, candidates, limit
                )));
            }
            let resolvable: i64 =
                tx.query_row(&format!("SELECT COUNT(*) {}", joined), params, |r| r.get(0))?;
            let inserted = tx.execute(&insert, params)?;
            Ok(MembershipJoinStats {
                candidates,
                resolvable: resolvable as usize,
                inserted,
            })
        })
    }
}

fn order_by(schema: &TableSchema, alias: Option<&str>) -> String {
    schema
        .primary_key
        .iter()
        .map(|c| match alias {
            Some(a) => format!("{}.{}", a, quote_ident(c)),
            None => quote_ident(c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
