//! Declarative mapping tables
//!
//! The domain schema lives in YAML: which raw entity type feeds which table,
//! where each column comes from, and which multi-valued fields become
//! membership rows.
//!
//! ```yaml
//! version: 1
//! entities:
//!   - entity_type: subject
//!     table: subject
//!     primary_key: [subject_uuid]
//!     columns:
//!       - { name: subject_uuid, type: uuid, source: { kind: entity_id } }
//!       - { name: nickname, type: text, source: { kind: field, name: nickname } }
//!       - name: lab_name
//!         type: text
//!         source: { kind: foreign_key, field: lab, table: lab, column: lab_name, match_column: lab_uuid }
//! memberships:
//!   - table: subject_user
//!     parent_type: subject
//!     parent_table: subject
//!     field: responsible_users
//!     other_table: user
//!     columns:
//!       - { name: subject_uuid, type: uuid, from: parent, column: subject_uuid }
//!       - { name: user_name, type: text, from: other, column: user_name }
//! ```

use serde::{Deserialize, Serialize};
use shadowsync_storage::{ColumnDef, ColumnType, ForeignKey, JoinSide, SqlValue, TableSchema};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{OrchestratorError, Result};

pub const SUPPORTED_MAPPING_VERSIONS: &[u32] = &[1];

/// Where a column value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnSource {
    /// The raw entity's own id
    EntityId,
    /// A raw field, converted to the column type
    Field {
        name: String,
        #[serde(default)]
        default: Option<SqlValue>,
    },
    /// A raw field holding a reference, looked up in an already populated
    /// table: the row whose `match_column` (default `column`) equals the
    /// field value supplies `column`.
    ForeignKey {
        field: String,
        table: String,
        column: String,
        #[serde(default)]
        match_column: Option<String>,
    },
    Constant { value: SqlValue },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnMapping {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    pub source: ColumnSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityMapping {
    pub entity_type: String,
    pub table: String,
    pub primary_key: Vec<String>,
    /// Ordering constraints beyond the foreign keys
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub columns: Vec<ColumnMapping>,
    /// Groups of multi-valued fields that must have equal lengths
    #[serde(default)]
    pub paired_fields: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MembershipColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub from: JoinSide,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MembershipMapping {
    pub table: String,
    pub parent_type: String,
    pub parent_table: String,
    /// Multi-valued raw field of the parent entity
    pub field: String,
    pub other_table: String,
    /// Column of `other_table` matched against the field values
    /// (default: its source column)
    #[serde(default)]
    pub other_match_column: Option<String>,
    pub columns: Vec<MembershipColumn>,
}

/// YAML Schema v1
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingFileV1 {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub entities: Vec<EntityMapping>,
    #[serde(default)]
    pub memberships: Vec<MembershipMapping>,
}

/// Validated mapping table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingTable {
    pub entities: Vec<EntityMapping>,
    pub memberships: Vec<MembershipMapping>,
}

impl MappingTable {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::mapping(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: MappingFileV1 =
            serde_yaml::from_str(content).map_err(OrchestratorError::mapping)?;
        match file.version {
            None => {
                return Err(OrchestratorError::mapping(
                    "Missing 'version' field in mapping file",
                ))
            }
            Some(v) if !SUPPORTED_MAPPING_VERSIONS.contains(&v) => {
                return Err(OrchestratorError::mapping(format!(
                    "Unsupported mapping version {}",
                    v
                )))
            }
            Some(_) => {}
        }
        let table = Self {
            entities: file.entities,
            memberships: file.memberships,
        };
        table.validate()?;
        Ok(table)
    }

    pub fn entity(&self, entity_type: &str) -> Option<&EntityMapping> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }

    fn entity_by_table(&self, table: &str) -> Option<&EntityMapping> {
        self.entities.iter().find(|e| e.table == table)
    }

    /// Cross-reference checks: every referenced table and column exists,
    /// no entity type or table is declared twice.
    pub fn validate(&self) -> Result<()> {
        let mut types = BTreeSet::new();
        let mut tables = BTreeSet::new();
        for entity in &self.entities {
            if !types.insert(entity.entity_type.as_str()) {
                return Err(OrchestratorError::mapping(format!(
                    "Entity type '{}' is mapped twice",
                    entity.entity_type
                )));
            }
            if !tables.insert(entity.table.as_str()) {
                return Err(OrchestratorError::mapping(format!(
                    "Table '{}' is mapped twice",
                    entity.table
                )));
            }
        }
        for membership in &self.memberships {
            if !tables.insert(membership.table.as_str()) {
                return Err(OrchestratorError::mapping(format!(
                    "Table '{}' is mapped twice",
                    membership.table
                )));
            }
        }

        for entity in &self.entities {
            entity.schema()?;
            for dep in &entity.depends_on {
                if !tables.contains(dep.as_str()) {
                    return Err(OrchestratorError::mapping(format!(
                        "Table '{}' depends on unknown table '{}'",
                        entity.table, dep
                    )));
                }
            }
            for column in &entity.columns {
                if let ColumnSource::ForeignKey {
                    table,
                    column: target,
                    match_column,
                    ..
                } = &column.source
                {
                    let referenced = self.entity_by_table(table).ok_or_else(|| {
                        OrchestratorError::mapping(format!(
                            "Column '{}.{}' references unknown table '{}'",
                            entity.table, column.name, table
                        ))
                    })?;
                    for col in std::iter::once(target).chain(match_column.iter()) {
                        if !referenced.has_column(col) {
                            return Err(OrchestratorError::mapping(format!(
                                "Column '{}.{}' references unknown column '{}.{}'",
                                entity.table, column.name, table, col
                            )));
                        }
                    }
                }
            }
        }

        for membership in &self.memberships {
            self.membership_schema(membership)?;
        }
        Ok(())
    }

    /// Table definition of a membership mapping, with one logical foreign
    /// key per side.
    pub fn membership_schema(&self, membership: &MembershipMapping) -> Result<TableSchema> {
        let parent = self.entity_by_table(&membership.parent_table).ok_or_else(|| {
            OrchestratorError::mapping(format!(
                "Membership '{}' has unknown parent table '{}'",
                membership.table, membership.parent_table
            ))
        })?;
        if parent.entity_type != membership.parent_type {
            return Err(OrchestratorError::mapping(format!(
                "Membership '{}': table '{}' holds '{}' entities, not '{}'",
                membership.table, parent.table, parent.entity_type, membership.parent_type
            )));
        }
        let other = self.entity_by_table(&membership.other_table).ok_or_else(|| {
            OrchestratorError::mapping(format!(
                "Membership '{}' has unknown other table '{}'",
                membership.table, membership.other_table
            ))
        })?;
        let match_column = self.other_match_column(membership)?;
        if !other.has_column(&match_column) {
            return Err(OrchestratorError::mapping(format!(
                "Membership '{}' matches on unknown column '{}.{}'",
                membership.table, other.table, match_column
            )));
        }

        let mut parent_fk: (Vec<&str>, Vec<&str>) = (Vec::new(), Vec::new());
        let mut other_fk: (Vec<&str>, Vec<&str>) = (Vec::new(), Vec::new());
        for column in &membership.columns {
            let (side, fk) = match column.from {
                JoinSide::Parent => (parent, &mut parent_fk),
                JoinSide::Other => (other, &mut other_fk),
            };
            if !side.has_column(&column.column) {
                return Err(OrchestratorError::mapping(format!(
                    "Membership '{}' column '{}' reads unknown column '{}.{}'",
                    membership.table, column.name, side.table, column.column
                )));
            }
            fk.0.push(column.name.as_str());
            fk.1.push(column.column.as_str());
        }
        if parent_fk.0.is_empty() || other_fk.0.is_empty() {
            return Err(OrchestratorError::mapping(format!(
                "Membership '{}' needs columns from both the parent and the other table",
                membership.table
            )));
        }

        let columns = membership
            .columns
            .iter()
            .map(|c| ColumnDef::new(c.name.clone(), c.column_type))
            .collect();
        let schema = TableSchema::membership(membership.table.clone(), columns)
            .with_foreign_key(ForeignKey::new(&parent_fk.0, parent.table.clone(), &parent_fk.1))
            .with_foreign_key(ForeignKey::new(&other_fk.0, other.table.clone(), &other_fk.1));
        schema.validate().map_err(OrchestratorError::mapping)?;
        Ok(schema)
    }

    pub fn other_match_column(&self, membership: &MembershipMapping) -> Result<String> {
        if let Some(column) = &membership.other_match_column {
            return Ok(column.clone());
        }
        self.entity_by_table(&membership.other_table)
            .and_then(EntityMapping::source_column)
            .map(str::to_string)
            .ok_or_else(|| {
                OrchestratorError::mapping(format!(
                    "Membership '{}' needs other_match_column: '{}' has no entity_id column",
                    membership.table, membership.other_table
                ))
            })
    }
}

impl EntityMapping {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// First column filled from the entity id
    pub fn source_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| matches!(c.source, ColumnSource::EntityId))
            .map(|c| c.name.as_str())
    }

    /// Raw field names this mapping reads
    pub fn fields_used(&self) -> BTreeSet<String> {
        let mut fields: BTreeSet<String> = self
            .columns
            .iter()
            .filter_map(|c| match &c.source {
                ColumnSource::Field { name, .. } => Some(name.clone()),
                ColumnSource::ForeignKey { field, .. } => Some(field.clone()),
                ColumnSource::EntityId | ColumnSource::Constant { .. } => None,
            })
            .collect();
        fields.extend(self.paired_fields.iter().flatten().cloned());
        fields
    }

    /// Table definition, with one logical foreign key per reference column.
    pub fn schema(&self) -> Result<TableSchema> {
        let source = self.source_column().ok_or_else(|| {
            OrchestratorError::mapping(format!(
                "Table '{}' has no column with source kind 'entity_id'",
                self.table
            ))
        })?;

        let columns = self
            .columns
            .iter()
            .map(|c| {
                let def = ColumnDef::new(c.name.clone(), c.column_type);
                if c.nullable {
                    def.nullable()
                } else {
                    def
                }
            })
            .collect();
        let primary_key: Vec<&str> = self.primary_key.iter().map(String::as_str).collect();

        let mut schema =
            TableSchema::entity(self.table.clone(), columns, &primary_key).with_source_column(source);
        for column in &self.columns {
            if let ColumnSource::ForeignKey { table, column: target, .. } = &column.source {
                schema = schema.with_foreign_key(ForeignKey::new(
                    &[column.name.as_str()],
                    table.clone(),
                    &[target.as_str()],
                ));
            }
        }
        schema.validate().map_err(OrchestratorError::mapping)?;
        Ok(schema)
    }

    /// `depends_on` keyed by table, for the table graph
    pub fn extra_dependencies(&self) -> BTreeMap<String, Vec<String>> {
        let mut extra = BTreeMap::new();
        if !self.depends_on.is_empty() {
            extra.insert(self.table.clone(), self.depends_on.clone());
        }
        extra
    }
}
