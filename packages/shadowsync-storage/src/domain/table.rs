//! Typed relational table definitions for shadow, membership and real tables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::{Result, StorageError};

/// Column storage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
    Json,
    Uuid,
}

impl ColumnType {
    /// SQLite column affinity
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Timestamp | ColumnType::Json | ColumnType::Uuid => {
                "TEXT"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// `columns` of this table reference `referenced_columns` of `references`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub references: String,
    pub referenced_columns: Vec<String>,
}

impl ForeignKey {
    pub fn new(columns: &[&str], references: impl Into<String>, referenced_columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            references: references.into(),
            referenced_columns: referenced_columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// One row per resolved raw entity
    Entity,
    /// Join rows populated from a multi-valued raw field
    Membership,
}

/// Which copy of a logical table is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableLayer {
    Shadow,
    Real,
}

impl TableLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableLayer::Shadow => "shadow",
            TableLayer::Real => "real",
        }
    }
}

/// Logical table definition shared by the shadow and real copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    /// Column holding the originating raw entity id (entity tables only)
    #[serde(default)]
    pub source_column: Option<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn entity(name: impl Into<String>, columns: Vec<ColumnDef>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Entity,
            columns,
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            source_column: None,
            foreign_keys: Vec::new(),
        }
    }

    pub fn membership(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let primary_key = columns.iter().map(|c| c.name.clone()).collect();
        Self {
            name: name.into(),
            kind: TableKind::Membership,
            columns,
            primary_key,
            source_column: None,
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_source_column(mut self, column: impl Into<String>) -> Self {
        self.source_column = Some(column.into());
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Materialized name: `{prefix}{name}` for shadow, `{name}` for real.
    pub fn physical_name(&self, layer: TableLayer, prefix: &str) -> String {
        match layer {
            TableLayer::Shadow => format!("{}{}", prefix, self.name),
            TableLayer::Real => self.name.clone(),
        }
    }

    pub fn is_membership(&self) -> bool {
        self.kind == TableKind::Membership
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns outside the primary key
    pub fn value_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|name| !self.primary_key.iter().any(|pk| pk == name))
            .collect()
    }

    /// Tables this one references, deduplicated, in declaration order
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.foreign_keys
            .iter()
            .map(|fk| fk.references.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Primary key values of `row`, in key order.
    pub fn key_of(&self, row: &Row) -> Result<Vec<SqlValue>> {
        self.primary_key
            .iter()
            .map(|col| {
                row.get(col).cloned().ok_or_else(|| {
                    StorageError::config(format!(
                        "Row for table '{}' is missing key column '{}'",
                        self.name, col
                    ))
                })
            })
            .collect()
    }

    /// Structural validation of the definition itself.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(StorageError::config(format!(
                "Table '{}' has no columns",
                self.name
            )));
        }
        if self.primary_key.is_empty() {
            return Err(StorageError::config(format!(
                "Table '{}' has no primary key",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for col in &self.columns {
            validate_identifier(&col.name)?;
            if !names.insert(col.name.as_str()) {
                return Err(StorageError::config(format!(
                    "Table '{}' declares column '{}' twice",
                    self.name, col.name
                )));
            }
        }
        validate_identifier(&self.name)?;

        for pk in &self.primary_key {
            if !names.contains(pk.as_str()) {
                return Err(StorageError::config(format!(
                    "Primary key column '{}' missing from table '{}'",
                    pk, self.name
                )));
            }
        }

        if let Some(source) = &self.source_column {
            if !names.contains(source.as_str()) {
                return Err(StorageError::config(format!(
                    "Source column '{}' missing from table '{}'",
                    source, self.name
                )));
            }
        }

        for fk in &self.foreign_keys {
            if fk.columns.is_empty() || fk.columns.len() != fk.referenced_columns.len() {
                return Err(StorageError::config(format!(
                    "Foreign key from '{}' to '{}' has mismatched column lists",
                    self.name, fk.references
                )));
            }
            for col in &fk.columns {
                if !names.contains(col.as_str()) {
                    return Err(StorageError::config(format!(
                        "Foreign key column '{}' missing from table '{}'",
                        col, self.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Identifiers are interpolated into SQL, so they are restricted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::config(format!("Invalid identifier '{}'", name)))
    }
}

/// Dynamically typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Stable textual form used for reservation keys and log lines.
    pub fn key_string(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(f) => format!("{:?}", f),
            SqlValue::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_string())
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(value as i64)
    }
}

/// Column name → value
pub type Row = BTreeMap<String, SqlValue>;

/// Equality filter on named columns; `Null` matches `IS NULL`.
pub type Filter = Vec<(String, SqlValue)>;

/// Which side of a membership join a column comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSide {
    Parent,
    Other,
}

/// Target column of a membership table and where its value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinColumn {
    pub name: String,
    pub side: JoinSide,
    pub column: String,
}

/// Set-oriented membership population: for every raw entity of
/// `parent_type` and every value of its `field_name`, join the parent's
/// resolved row with the `other_table` row whose `other_match_column`
/// equals the value. All table names are physical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipJoin {
    pub target: String,
    pub parent_type: String,
    pub field_name: String,
    pub parent_table: String,
    pub parent_source_column: String,
    pub other_table: String,
    pub other_match_column: String,
    /// Match column holds UUIDs, compared case-insensitively
    pub match_uuid: bool,
    pub columns: Vec<JoinColumn>,
}

/// Ordered deletes that make up the invalidation of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletePlan {
    pub key: String,
    pub steps: Vec<DeleteStep>,
}

/// Delete rows of one physical table matching a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStep {
    pub table: String,
    pub filter: Filter,
}

/// Field-level update of one row identified by `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    pub key: Filter,
    pub changes: Vec<(String, SqlValue)>,
}

/// Joins key values into a single reservation/log key.
pub fn key_string(values: &[SqlValue]) -> String {
    values
        .iter()
        .map(SqlValue::key_string)
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(feature = "sqlite")]
mod sqlite_conv {
    use super::SqlValue;
    use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};

    impl ToSql for SqlValue {
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            Ok(match self {
                SqlValue::Null => ToSqlOutput::Owned(Value::Null),
                SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
                SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
                SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            })
        }
    }

    impl FromSql for SqlValue {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            Ok(match value {
                ValueRef::Null => SqlValue::Null,
                ValueRef::Integer(i) => SqlValue::Integer(i),
                ValueRef::Real(f) => SqlValue::Real(f),
                ValueRef::Text(t) | ValueRef::Blob(t) => {
                    SqlValue::Text(String::from_utf8_lossy(t).into_owned())
                }
            })
        }
    }
}
