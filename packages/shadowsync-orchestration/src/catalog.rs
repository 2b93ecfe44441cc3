//! Table catalog: every derived table, its resolver or membership join, and
//! the dependency structure between them.

use shadowsync_storage::{ColumnType, JoinColumn, MembershipJoin, TableLayer, TableSchema};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::dag::TableGraph;
use crate::dependency_graph::{compute_affected_tables, ReverseReferenceIndex};
use crate::error::{OrchestratorError, Result};
use crate::mapping::{MappingTable, MembershipMapping};
use crate::resolver::{declarative_resolvers, EntityResolver};

/// A membership table populated from a multi-valued field
#[derive(Debug, Clone)]
pub struct MembershipSpec {
    pub mapping: MembershipMapping,
    pub schema: TableSchema,
    pub parent_source_column: String,
    pub other_match_column: String,
}

pub struct TableCatalog {
    resolvers: BTreeMap<String, Box<dyn EntityResolver>>,
    memberships: BTreeMap<String, MembershipSpec>,
    graph: TableGraph,
    references: ReverseReferenceIndex,
}

impl TableCatalog {
    pub fn empty() -> Result<Self> {
        Ok(Self {
            resolvers: BTreeMap::new(),
            memberships: BTreeMap::new(),
            graph: TableGraph::new(Vec::new())?,
            references: ReverseReferenceIndex::new(),
        })
    }

    /// Declarative resolvers and membership joins for a mapping table.
    pub fn from_mapping(mapping: &MappingTable) -> Result<Self> {
        let mut catalog = Self::empty()?;
        for resolver in declarative_resolvers(&mapping.entities)? {
            catalog
                .resolvers
                .insert(resolver.schema().name.clone(), resolver);
        }
        for membership in &mapping.memberships {
            let schema = mapping.membership_schema(membership)?;
            let parent_source_column = mapping
                .entity(&membership.parent_type)
                .and_then(|e| e.source_column())
                .map(str::to_string)
                .ok_or_else(|| {
                    OrchestratorError::mapping(format!(
                        "Membership '{}' parent has no entity_id column",
                        membership.table
                    ))
                })?;
            catalog.memberships.insert(
                membership.table.clone(),
                MembershipSpec {
                    mapping: membership.clone(),
                    schema,
                    parent_source_column,
                    other_match_column: mapping.other_match_column(membership)?,
                },
            );
        }
        catalog.rebuild()?;
        Ok(catalog)
    }

    /// Add a resolver, or replace the one for its table.
    pub fn register(&mut self, resolver: Box<dyn EntityResolver>) -> Result<()> {
        let schema = resolver.schema();
        schema.validate().map_err(OrchestratorError::mapping)?;
        if schema.is_membership() || self.memberships.contains_key(&schema.name) {
            return Err(OrchestratorError::mapping(format!(
                "Resolver for '{}' must target an entity table",
                schema.name
            )));
        }
        if schema.source_column.is_none() {
            return Err(OrchestratorError::mapping(format!(
                "Table '{}' has no source column",
                schema.name
            )));
        }
        let name = schema.name.clone();
        let previous = self.resolvers.insert(name.clone(), resolver);
        if let Err(e) = self.rebuild() {
            match previous {
                Some(previous) => self.resolvers.insert(name, previous),
                None => self.resolvers.remove(&name),
            };
            return Err(e);
        }
        Ok(())
    }

    fn rebuild(&mut self) -> Result<()> {
        let schemas: Vec<TableSchema> = self.schemas().cloned().collect();
        let extra: BTreeMap<String, Vec<String>> = self
            .resolvers
            .iter()
            .map(|(table, r)| (table.clone(), r.depends_on()))
            .filter(|(_, deps)| !deps.is_empty())
            .collect();
        self.graph = TableGraph::from_schemas(&schemas, &extra)?;
        self.references = ReverseReferenceIndex::from_schemas(&schemas);
        Ok(())
    }

    pub fn schemas(&self) -> impl Iterator<Item = &TableSchema> {
        self.resolvers
            .values()
            .map(|r| r.schema())
            .chain(self.memberships.values().map(|m| &m.schema))
    }

    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.resolvers
            .get(table)
            .map(|r| r.schema())
            .or_else(|| self.memberships.get(table).map(|m| &m.schema))
    }

    pub fn resolver(&self, table: &str) -> Option<&dyn EntityResolver> {
        self.resolvers.get(table).map(|r| r.as_ref())
    }

    pub fn membership(&self, table: &str) -> Option<&MembershipSpec> {
        self.memberships.get(table)
    }

    /// Parents-first order of all tables
    pub fn order(&self) -> Vec<&str> {
        self.graph.order()
    }

    pub fn entity_tables(&self) -> Vec<&str> {
        self.order()
            .into_iter()
            .filter(|t| self.resolvers.contains_key(*t))
            .collect()
    }

    pub fn membership_tables(&self) -> Vec<&str> {
        self.order()
            .into_iter()
            .filter(|t| self.memberships.contains_key(*t))
            .collect()
    }

    pub fn graph(&self) -> &TableGraph {
        &self.graph
    }

    pub fn references(&self) -> &ReverseReferenceIndex {
        &self.references
    }

    /// Every table transitively referencing `table`
    pub fn descendants(&self, table: &str) -> BTreeSet<String> {
        compute_affected_tables(&[table], &self.references)
    }

    pub fn entity_type_of_table(&self, table: &str) -> Option<&str> {
        self.resolvers.get(table).map(|r| r.entity_type())
    }

    /// Entity tables fed by `entity_type`
    pub fn tables_for_type(&self, entity_type: &str) -> Vec<&str> {
        self.entity_tables()
            .into_iter()
            .filter(|t| self.entity_type_of_table(t) == Some(entity_type))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resolvers.len() + self.memberships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entity type → raw fields some derived table reads (`None`: any).
    pub fn participating_fields(&self) -> HashMap<String, Option<BTreeSet<String>>> {
        let mut participating: HashMap<String, Option<BTreeSet<String>>> = HashMap::new();
        for resolver in self.resolvers.values() {
            let used = resolver.fields_used();
            let entry = participating
                .entry(resolver.entity_type().to_string())
                .or_insert_with(|| Some(BTreeSet::new()));
            match used {
                None => *entry = None,
                Some(used) => {
                    if let Some(fields) = entry {
                        fields.extend(used);
                    }
                }
            }
        }
        for membership in self.memberships.values() {
            let entry = participating
                .entry(membership.mapping.parent_type.clone())
                .or_insert_with(|| Some(BTreeSet::new()));
            if let Some(fields) = entry {
                fields.insert(membership.mapping.field.clone());
            }
        }
        participating
    }

    /// Set-oriented join populating membership `table` in the given layer.
    pub fn membership_join(&self, table: &str, layer: TableLayer, prefix: &str) -> Option<MembershipJoin> {
        let spec = self.memberships.get(table)?;
        let parent = self.schema(&spec.mapping.parent_table)?;
        let other = self.schema(&spec.mapping.other_table)?;
        Some(MembershipJoin {
            target: spec.schema.physical_name(layer, prefix),
            parent_type: spec.mapping.parent_type.clone(),
            field_name: spec.mapping.field.clone(),
            parent_table: parent.physical_name(layer, prefix),
            parent_source_column: spec.parent_source_column.clone(),
            other_table: other.physical_name(layer, prefix),
            other_match_column: spec.other_match_column.clone(),
            match_uuid: other
                .column(&spec.other_match_column)
                .map_or(false, |c| c.column_type == ColumnType::Uuid),
            columns: spec
                .mapping
                .columns
                .iter()
                .map(|c| JoinColumn {
                    name: c.name.clone(),
                    side: c.from,
                    column: c.column.clone(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EntityError;
    use crate::resolver::ResolveContext;
    use shadowsync_storage::{ColumnDef, ColumnType, ForeignKey, RawEntity, Row, SqlValue};

    const MAPPING: &str = r#"
version: 1
entities:
  - entity_type: lab
    table: lab
    primary_key: [lab_name]
    columns:
      - { name: lab_uuid, type: uuid, source: { kind: entity_id } }
      - { name: lab_name, type: text, source: { kind: field, name: name } }
  - entity_type: user
    table: user
    primary_key: [user_name]
    columns:
      - { name: user_uuid, type: uuid, source: { kind: entity_id } }
      - { name: user_name, type: text, source: { kind: field, name: username } }
  - entity_type: subject
    table: subject
    primary_key: [subject_uuid]
    columns:
      - { name: subject_uuid, type: uuid, source: { kind: entity_id } }
      - name: lab_name
        type: text
        source: { kind: foreign_key, field: lab, table: lab, column: lab_name, match_column: lab_uuid }
memberships:
  - table: subject_user
    parent_type: subject
    parent_table: subject
    field: responsible_users
    other_table: user
    columns:
      - { name: subject_uuid, type: uuid, from: parent, column: subject_uuid }
      - { name: user_name, type: text, from: other, column: user_name }
"#;

    fn catalog() -> TableCatalog {
        TableCatalog::from_mapping(&MappingTable::from_yaml_str(MAPPING).unwrap()).unwrap()
    }

    /// Resolver reading every field of a session
    struct SessionResolver {
        schema: TableSchema,
    }

    impl SessionResolver {
        fn new() -> Self {
            Self {
                schema: TableSchema::entity(
                    "session",
                    vec![
                        ColumnDef::new("session_uuid", ColumnType::Uuid),
                        ColumnDef::new("subject_uuid", ColumnType::Uuid),
                    ],
                    &["session_uuid"],
                )
                .with_source_column("session_uuid")
                .with_foreign_key(ForeignKey::new(
                    &["subject_uuid"],
                    "subject",
                    &["subject_uuid"],
                )),
            }
        }
    }

    impl EntityResolver for SessionResolver {
        fn entity_type(&self) -> &str {
            "session"
        }

        fn schema(&self) -> &TableSchema {
            &self.schema
        }

        fn resolve(
            &self,
            entity: &RawEntity,
            ctx: &ResolveContext<'_>,
        ) -> std::result::Result<Row, EntityError> {
            let subject = entity
                .scalar("subject")
                .map_err(|e| EntityError::integrity(e.to_string()))?
                .ok_or_else(|| EntityError::integrity("session without subject"))?;
            ctx.require("subject", "subject_uuid", subject)?;
            let mut row = Row::new();
            row.insert("session_uuid".into(), SqlValue::text(entity.id().to_string()));
            row.insert("subject_uuid".into(), SqlValue::text(subject));
            Ok(row)
        }
    }

    #[test]
    fn test_order_and_kinds() {
        let catalog = catalog();
        assert_eq!(catalog.order(), vec!["lab", "user", "subject", "subject_user"]);
        assert_eq!(catalog.entity_tables(), vec!["lab", "user", "subject"]);
        assert_eq!(catalog.membership_tables(), vec!["subject_user"]);
        assert_eq!(catalog.entity_type_of_table("subject"), Some("subject"));
        assert_eq!(catalog.entity_type_of_table("subject_user"), None);
    }

    #[test]
    fn test_descendants() {
        let catalog = catalog();
        let lab: Vec<String> = catalog.descendants("lab").into_iter().collect();
        assert_eq!(lab, vec!["subject", "subject_user"]);
        assert!(catalog.descendants("subject_user").is_empty());
    }

    #[test]
    fn test_participating_fields() {
        let participating = catalog().participating_fields();
        let subject = participating["subject"].as_ref().unwrap();
        assert!(subject.contains("lab"));
        assert!(subject.contains("responsible_users"));
        assert!(!participating.contains_key("session"));
    }

    #[test]
    fn test_register_custom_resolver() {
        let mut catalog = catalog();
        catalog.register(Box::new(SessionResolver::new())).unwrap();
        assert_eq!(catalog.graph().position("session"), Some(3));
        assert!(catalog.descendants("lab").contains("session"));
        // custom resolvers read any field
        assert!(catalog.participating_fields()["session"].is_none());
    }

    #[test]
    fn test_register_rejects_unknown_parent() {
        let mut catalog = TableCatalog::empty().unwrap();
        let err = catalog.register(Box::new(SessionResolver::new())).unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingDependency(_)));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_membership_join_names() {
        let join = catalog()
            .membership_join("subject_user", TableLayer::Shadow, "shadow_")
            .unwrap();
        assert_eq!(join.target, "shadow_subject_user");
        assert_eq!(join.parent_table, "shadow_subject");
        assert_eq!(join.other_table, "shadow_user");
        assert_eq!(join.other_match_column, "user_uuid");
        assert!(join.match_uuid);
        assert_eq!(join.parent_source_column, "subject_uuid");
    }
}
