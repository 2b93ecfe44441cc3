//! Entity resolvers: raw entity → one typed table row.
//!
//! A resolver never writes. It reads the raw entity, looks up the rows it
//! references through [`ResolveContext`], and returns the row or an
//! [`EntityError`] that the populate stage counts and skips.

use shadowsync_storage::{
    ColumnType, LedgerStore, RawEntity, RawStore, Row, SqlValue, SqliteStore, StorageError,
    TableLayer, TableSchema, NONE_SENTINEL,
};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::catalog::TableCatalog;
use crate::error::{EntityError, Result};
use crate::mapping::{ColumnMapping, ColumnSource, EntityMapping};
use crate::snapshot::canonical_key;

/// Resolution of one entity type into one table.
pub trait EntityResolver: Send + Sync {
    fn entity_type(&self) -> &str;

    fn schema(&self) -> &TableSchema;

    /// Raw fields the row depends on; `None` means any field may matter.
    fn fields_used(&self) -> Option<BTreeSet<String>> {
        None
    }

    /// Tables that must be populated first, beyond the foreign keys
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Entities still to resolve: raw records with no row in `physical`.
    fn select(&self, store: &SqliteStore, physical: &str) -> std::result::Result<Vec<Uuid>, StorageError> {
        let schema = self.schema();
        let source = schema.source_column.as_deref().ok_or_else(|| {
            StorageError::config(format!("Table '{}' has no source column", schema.name))
        })?;
        store.unresolved_entities(self.entity_type(), physical, source)
    }

    fn resolve(&self, entity: &RawEntity, ctx: &ResolveContext<'_>) -> std::result::Result<Row, EntityError>;
}

/// Read access for resolvers: shadow tables and raw records.
pub struct ResolveContext<'a> {
    pub store: &'a SqliteStore,
    pub catalog: &'a TableCatalog,
    pub prefix: &'a str,
    /// Keys deleted upstream in the current job
    pub known_deleted: &'a BTreeSet<String>,
}

impl<'a> ResolveContext<'a> {
    /// Shadow row of `table` whose `column` equals `value`.
    pub fn lookup(
        &self,
        table: &str,
        column: &str,
        value: &SqlValue,
    ) -> std::result::Result<Option<Row>, EntityError> {
        let schema = self
            .catalog
            .schema(table)
            .ok_or_else(|| EntityError::integrity(format!("unknown table '{}'", table)))?;
        let physical = schema.physical_name(TableLayer::Shadow, self.prefix);
        let rows = self
            .store
            .select_rows(schema, &physical, &vec![(column.to_string(), value.clone())])?;
        Ok(rows.into_iter().next())
    }

    /// Like [`Self::lookup`], but a missing row is an error: a referential
    /// violation when the referenced entity is known to be gone (deleted in
    /// this job or an earlier one, or a raw record of another type),
    /// otherwise a missing dependency to retry later.
    pub fn require(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> std::result::Result<Row, EntityError> {
        let is_uuid = self
            .catalog
            .schema(table)
            .and_then(|schema| schema.column(column))
            .map_or(false, |c| c.column_type == ColumnType::Uuid);
        let value = if is_uuid {
            canonical_key(value)
        } else {
            value.to_string()
        };
        if let Some(row) = self.lookup(table, column, &SqlValue::text(value.as_str()))? {
            return Ok(row);
        }
        if self.known_deleted.contains(&value) {
            return Err(EntityError::referential(table, &value));
        }
        if let (Ok(id), Some(expected)) = (
            Uuid::parse_str(&value),
            self.catalog.entity_type_of_table(table),
        ) {
            match self.store.entity_type_of(id)? {
                Some(actual) if actual != expected => {
                    return Err(EntityError::referential(table, &value));
                }
                Some(_) => {}
                None if self.store.was_deleted(&value)? => {
                    return Err(EntityError::referential(table, &value));
                }
                None => {}
            }
        }
        Err(EntityError::missing(table, &value))
    }
}

/// Resolver driven by an [`EntityMapping`].
pub struct DeclarativeResolver {
    mapping: EntityMapping,
    schema: TableSchema,
}

impl DeclarativeResolver {
    pub fn new(mapping: EntityMapping) -> Result<Self> {
        let schema = mapping.schema()?;
        Ok(Self { mapping, schema })
    }

    pub fn mapping(&self) -> &EntityMapping {
        &self.mapping
    }

    fn check_paired_fields(&self, entity: &RawEntity) -> std::result::Result<(), EntityError> {
        for group in &self.mapping.paired_fields {
            let lengths: Vec<(&str, usize)> = group
                .iter()
                .map(|field| (field.as_str(), element_count(entity, field)))
                .collect();
            if let Some(((first, n), rest)) = lengths.split_first().map(|(f, r)| (*f, r)) {
                if let Some((other, m)) = rest.iter().find(|(_, m)| *m != n) {
                    return Err(EntityError::integrity(format!(
                        "paired fields '{}' ({} values) and '{}' ({} values) differ in length",
                        first, n, other, m
                    )));
                }
            }
        }
        Ok(())
    }

    fn column_value(
        &self,
        column: &ColumnMapping,
        entity: &RawEntity,
        ctx: &ResolveContext<'_>,
    ) -> std::result::Result<SqlValue, EntityError> {
        match &column.source {
            ColumnSource::EntityId => Ok(SqlValue::text(entity.id().to_string())),
            ColumnSource::Constant { value } => Ok(value.clone()),
            ColumnSource::Field { name, default } => {
                match single_value(entity, name, column)? {
                    Some(raw) => convert(&raw, column),
                    None => match default {
                        Some(value) => Ok(value.clone()),
                        None => empty_value(column, name),
                    },
                }
            }
            ColumnSource::ForeignKey {
                field,
                table,
                column: target,
                match_column,
            } => match single_value(entity, field, column)? {
                Some(reference) => {
                    let match_column = match_column.as_deref().unwrap_or(target);
                    let row = ctx.require(table, match_column, &reference)?;
                    Ok(row.get(target).cloned().unwrap_or(SqlValue::Null))
                }
                None => empty_value(column, field),
            },
        }
    }
}

impl EntityResolver for DeclarativeResolver {
    fn entity_type(&self) -> &str {
        &self.mapping.entity_type
    }

    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn fields_used(&self) -> Option<BTreeSet<String>> {
        Some(self.mapping.fields_used())
    }

    fn depends_on(&self) -> Vec<String> {
        self.mapping.depends_on.clone()
    }

    fn resolve(&self, entity: &RawEntity, ctx: &ResolveContext<'_>) -> std::result::Result<Row, EntityError> {
        if entity.entity_type() != self.mapping.entity_type {
            return Err(EntityError::integrity(format!(
                "entity {} is a '{}', table '{}' maps '{}'",
                entity.id(),
                entity.entity_type(),
                self.schema.name,
                self.mapping.entity_type
            )));
        }
        self.check_paired_fields(entity)?;

        let mut row = Row::new();
        for column in &self.mapping.columns {
            let value = self.column_value(column, entity, ctx)?;
            row.insert(column.name.clone(), value);
        }
        Ok(row)
    }
}

/// Number of stored elements of a field. Null elements count; only an
/// absent field or a lone empty sentinel is the empty list.
fn element_count(entity: &RawEntity, field: &str) -> usize {
    match entity.fields.get(field).map(Vec::as_slice) {
        None => 0,
        Some([only]) if only.as_deref().map_or(true, |v| v == NONE_SENTINEL) => 0,
        Some(values) => values.len(),
    }
}

/// Stored values of a field without empty sentinels; absent fields are empty.
fn present_values<'e>(entity: &'e RawEntity, field: &str) -> Vec<&'e str> {
    entity
        .fields
        .get(field)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_deref())
                .filter(|v| *v != NONE_SENTINEL)
                .collect()
        })
        .unwrap_or_default()
}

/// The one value a column takes from `field`. Several values only fit a
/// json column, which receives them as an array.
fn single_value(
    entity: &RawEntity,
    field: &str,
    column: &ColumnMapping,
) -> std::result::Result<Option<String>, EntityError> {
    let values = present_values(entity, field);
    match values.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(one.to_string())),
        many if column.column_type == ColumnType::Json => serde_json::to_string(many)
            .map(Some)
            .map_err(|e| EntityError::integrity(format!("field '{}': {}", field, e))),
        many => Err(EntityError::integrity(format!(
            "field '{}' has {} values but column '{}' holds one",
            field,
            many.len(),
            column.name
        ))),
    }
}

fn empty_value(column: &ColumnMapping, field: &str) -> std::result::Result<SqlValue, EntityError> {
    if column.nullable {
        Ok(SqlValue::Null)
    } else {
        Err(EntityError::integrity(format!(
            "required field '{}' for column '{}' is empty",
            field, column.name
        )))
    }
}

/// Convert a normalized raw string to the column's storage type.
fn convert(raw: &str, column: &ColumnMapping) -> std::result::Result<SqlValue, EntityError> {
    let invalid = || {
        EntityError::integrity(format!(
            "value '{}' is not a valid {:?} for column '{}'",
            raw, column.column_type, column.name
        ))
    };
    match column.column_type {
        ColumnType::Integer => raw.trim().parse::<i64>().map(SqlValue::Integer).map_err(|_| invalid()),
        ColumnType::Real => raw.trim().parse::<f64>().map(SqlValue::Real).map_err(|_| invalid()),
        ColumnType::Boolean => match raw.trim() {
            "True" | "true" | "1" => Ok(SqlValue::Integer(1)),
            "False" | "false" | "0" => Ok(SqlValue::Integer(0)),
            _ => Err(invalid()),
        },
        ColumnType::Uuid => Uuid::parse_str(raw.trim())
            .map(|id| SqlValue::text(id.to_string()))
            .map_err(|_| invalid()),
        ColumnType::Text | ColumnType::Timestamp | ColumnType::Json => Ok(SqlValue::text(raw)),
    }
}

/// Declarative resolvers for every entity of a mapping table.
pub fn declarative_resolvers(mapping: &[EntityMapping]) -> Result<Vec<Box<dyn EntityResolver>>> {
    mapping
        .iter()
        .map(|m| {
            DeclarativeResolver::new(m.clone()).map(|r| Box::new(r) as Box<dyn EntityResolver>)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingTable;
    use chrono::Utc;
    use shadowsync_storage::{BatchWriter, DiffResult, NewJob, RawRecord, WriteMode};
    use std::collections::BTreeMap;

    const MAPPING: &str = r#"
version: 1
entities:
  - entity_type: lab
    table: lab
    primary_key: [lab_name]
    columns:
      - { name: lab_uuid, type: uuid, source: { kind: entity_id } }
      - { name: lab_name, type: text, source: { kind: field, name: name } }
  - entity_type: subject
    table: subject
    primary_key: [subject_uuid]
    paired_fields: [[weights, weigh_dates]]
    columns:
      - { name: subject_uuid, type: uuid, source: { kind: entity_id } }
      - { name: nickname, type: text, source: { kind: field, name: nickname } }
      - { name: alive, type: boolean, source: { kind: field, name: alive, default: 1 } }
      - { name: weight, type: real, nullable: true, source: { kind: field, name: weight } }
      - { name: tags, type: json, nullable: true, source: { kind: field, name: tags } }
      - { name: origin, type: text, source: { kind: constant, value: upstream } }
      - name: lab_name
        type: text
        source: { kind: foreign_key, field: lab, table: lab, column: lab_name, match_column: lab_uuid }
"#;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn entity(n: u128, entity_type: &str, fields: &[(&str, Vec<&str>)]) -> RawEntity {
        let mut e = RawEntity::new(RawRecord::new(id(n), entity_type));
        for (name, values) in fields {
            e.fields.insert(
                name.to_string(),
                values.iter().map(|v| Some(v.to_string())).collect(),
            );
        }
        e
    }

    struct Fixture {
        store: SqliteStore,
        catalog: TableCatalog,
        deleted: BTreeSet<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let mapping = MappingTable::from_yaml_str(MAPPING).unwrap();
            let catalog = TableCatalog::from_mapping(&mapping).unwrap();
            let store = SqliteStore::in_memory().unwrap();
            for table in catalog.order() {
                let schema = catalog.schema(table).unwrap();
                store
                    .create_table(schema, &schema.physical_name(TableLayer::Shadow, "shadow_"))
                    .unwrap();
            }
            Self {
                store,
                catalog,
                deleted: BTreeSet::new(),
            }
        }

        fn ctx(&self) -> ResolveContext<'_> {
            ResolveContext {
                store: &self.store,
                catalog: &self.catalog,
                prefix: "shadow_",
                known_deleted: &self.deleted,
            }
        }

        fn insert_lab(&self) {
            let schema = self.catalog.schema("lab").unwrap();
            let mut writer = BatchWriter::new(
                self.store.table_row_sink(schema, "shadow_lab"),
                WriteMode::Insert,
            );
            let mut row = Row::new();
            row.insert("lab_uuid".to_string(), SqlValue::text(id(1).to_string()));
            row.insert("lab_name".to_string(), SqlValue::text("cortexlab"));
            writer.add(row);
            writer.finish().unwrap();
        }

        fn resolve(&self, e: &RawEntity) -> std::result::Result<Row, EntityError> {
            self.catalog.resolver("subject").unwrap().resolve(e, &self.ctx())
        }
    }

    fn subject(fields: &[(&str, Vec<&str>)]) -> RawEntity {
        let mut all = vec![
            ("nickname", vec!["mouse1"]),
            ("lab", vec!["00000000-0000-0000-0000-000000000001"]),
        ];
        all.extend_from_slice(fields);
        entity(10, "subject", &all)
    }

    #[test]
    fn test_resolves_typed_row() {
        let fx = Fixture::new();
        fx.insert_lab();
        let row = fx
            .resolve(&subject(&[("weight", vec!["21.5"]), ("tags", vec!["a", "b"])]))
            .unwrap();
        assert_eq!(row["nickname"], SqlValue::text("mouse1"));
        assert_eq!(row["lab_name"], SqlValue::text("cortexlab"));
        assert_eq!(row["alive"], SqlValue::Integer(1));
        assert_eq!(row["weight"], SqlValue::Real(21.5));
        assert_eq!(row["tags"], SqlValue::text(r#"["a","b"]"#));
        assert_eq!(row["origin"], SqlValue::text("upstream"));
    }

    #[test]
    fn test_sentinel_becomes_null_or_default() {
        let fx = Fixture::new();
        fx.insert_lab();
        let row = fx
            .resolve(&subject(&[("weight", vec!["None"]), ("alive", vec!["False"])]))
            .unwrap();
        assert_eq!(row["weight"], SqlValue::Null);
        assert_eq!(row["alive"], SqlValue::Integer(0));

        let err = fx.resolve(&entity(10, "subject", &[("nickname", vec!["None"])])).unwrap_err();
        assert!(matches!(err, EntityError::DataIntegrity(_)));
    }

    #[test]
    fn test_missing_parent_is_missing_dependency() {
        let fx = Fixture::new();
        let err = fx.resolve(&subject(&[])).unwrap_err();
        assert_eq!(err.kind(), "missing_dependency");
    }

    #[test]
    fn test_deleted_parent_is_referential_violation() {
        let mut fx = Fixture::new();
        fx.deleted.insert(id(1).to_string());
        let err = fx.resolve(&subject(&[])).unwrap_err();
        assert_eq!(err.kind(), "referential_violation");
    }

    #[test]
    fn test_parent_deleted_in_earlier_job_stays_referential_violation() {
        let fx = Fixture::new();
        let now = Utc::now();
        fx.store
            .insert_job_if_absent(&NewJob {
                job_date: now.date_naive(),
                timezone: "UTC".to_string(),
                current_snapshot_ts: now,
                previous_snapshot_ts: None,
                diff: DiffResult {
                    deleted: [id(1).to_string()].into_iter().collect(),
                    ..Default::default()
                },
            })
            .unwrap();
        let err = fx.resolve(&subject(&[])).unwrap_err();
        assert_eq!(err.kind(), "referential_violation");

        // recreated upstream, not yet resolved
        fx.store.upsert_entity(id(1), "lab").unwrap();
        let err = fx.resolve(&subject(&[])).unwrap_err();
        assert_eq!(err.kind(), "missing_dependency");
    }

    #[test]
    fn test_uuid_reference_matches_in_any_case() {
        let fx = Fixture::new();
        fx.insert_lab();
        let upper = id(1).to_string().to_uppercase();
        let row = fx
            .resolve(&entity(10, "subject", &[("nickname", vec!["m"]), ("lab", vec![upper.as_str()])]))
            .unwrap();
        assert_eq!(row["lab_name"], SqlValue::text("cortexlab"));
    }

    #[test]
    fn test_reference_to_wrong_type_is_referential_violation() {
        let fx = Fixture::new();
        let mut fields = BTreeMap::new();
        fields.insert("nickname".to_string(), vec!["other".to_string()]);
        fx.store.upsert_entity(id(1), "subject").unwrap();
        fx.store.upsert_fields(id(1), &fields).unwrap();

        let err = fx.resolve(&subject(&[])).unwrap_err();
        assert!(matches!(err, EntityError::ReferentialViolation { .. }));
    }

    #[test]
    fn test_integrity_failures() {
        let fx = Fixture::new();
        fx.insert_lab();

        let err = fx.resolve(&subject(&[("weight", vec!["heavy"])])).unwrap_err();
        assert!(err.to_string().contains("not a valid"));

        let err = fx.resolve(&subject(&[("weight", vec!["1", "2"])])).unwrap_err();
        assert!(err.to_string().contains("holds one"));

        let err = fx
            .resolve(&subject(&[("weights", vec!["20", "21"]), ("weigh_dates", vec!["2024-01-01"])]))
            .unwrap_err();
        assert!(err.to_string().contains("differ in length"));
    }

    #[test]
    fn test_paired_fields_count_null_elements() {
        let fx = Fixture::new();
        fx.insert_lab();
        // a missing weight keeps its slot
        fx.resolve(&subject(&[
            ("weights", vec!["20.5", "None"]),
            ("weigh_dates", vec!["2024-01-01", "2024-01-02"]),
        ]))
        .unwrap();
        // an empty list pairs with an absent field
        fx.resolve(&subject(&[("weights", vec!["None"])])).unwrap();

        let err = fx
            .resolve(&subject(&[
                ("weights", vec!["None", "None"]),
                ("weigh_dates", vec!["2024-01-01"]),
            ]))
            .unwrap_err();
        assert!(err.to_string().contains("(2 values)"));
    }

    #[test]
    fn test_wrong_entity_type_rejected() {
        let fx = Fixture::new();
        let err = fx.resolve(&entity(10, "lab", &[])).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Permanent);
    }
}
