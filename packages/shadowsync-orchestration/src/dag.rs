use crate::error::{OrchestratorError, Result};
use shadowsync_storage::TableSchema;
use std::collections::{BTreeMap, BTreeSet};

/// Table node in the dependency DAG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNode {
    pub name: String,
    /// Tables that must be populated first
    pub dependencies: Vec<String>,
}

impl TableNode {
    pub fn new(name: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            name: name.into(),
            dependencies,
        }
    }
}

/// Table dependency DAG with topological sort
///
/// Parents come before children. Tables within one group have no edge
/// between them and may be populated in any order (or concurrently).
#[derive(Debug, Clone)]
pub struct TableGraph {
    tables: BTreeMap<String, TableNode>,
    execution_order: Vec<Vec<String>>, // Vec of parallel groups
}

impl TableGraph {
    /// Create a graph from explicit nodes
    pub fn new(nodes: Vec<TableNode>) -> Result<Self> {
        let mut table_map = BTreeMap::new();
        for mut node in nodes {
            // a self-reference orders nothing
            let name = node.name.clone();
            node.dependencies.retain(|dep| *dep != name);
            node.dependencies.sort();
            node.dependencies.dedup();
            if table_map.insert(node.name.clone(), node).is_some() {
                return Err(OrchestratorError::mapping(format!(
                    "Table '{}' is defined twice",
                    name
                )));
            }
        }

        // Validate dependencies exist
        for node in table_map.values() {
            for dep in &node.dependencies {
                if !table_map.contains_key(dep) {
                    return Err(OrchestratorError::MissingDependency(format!(
                        "Table '{}' references non-existent table '{}'",
                        node.name, dep
                    )));
                }
            }
        }

        let execution_order = Self::topological_sort(&table_map)?;

        Ok(Self {
            tables: table_map,
            execution_order,
        })
    }

    /// Build from table definitions: every foreign key is an edge, plus any
    /// extra ordering constraints (`table → tables it waits for`).
    pub fn from_schemas(
        schemas: &[TableSchema],
        extra: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self> {
        let nodes = schemas
            .iter()
            .map(|schema| {
                let mut deps: Vec<String> = schema
                    .referenced_tables()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                if let Some(more) = extra.get(&schema.name) {
                    deps.extend(more.iter().cloned());
                }
                TableNode::new(schema.name.clone(), deps)
            })
            .collect();
        Self::new(nodes)
    }

    /// Kahn's algorithm, one group per wave; groups are sorted by name
    fn topological_sort(tables: &BTreeMap<String, TableNode>) -> Result<Vec<Vec<String>>> {
        let mut in_degree: BTreeMap<&str, usize> = tables
            .values()
            .map(|node| (node.name.as_str(), node.dependencies.len()))
            .collect();

        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in tables.values() {
            for dep in &node.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.name.as_str());
            }
        }

        let mut result = Vec::new();
        let mut processed = BTreeSet::new();

        while processed.len() < tables.len() {
            // Find all tables with in-degree 0 (can run in parallel)
            let ready: Vec<&str> = in_degree
                .iter()
                .filter(|(name, &degree)| degree == 0 && !processed.contains(*name))
                .map(|(&name, _)| name)
                .collect();

            if ready.is_empty() {
                let remaining: Vec<&str> = in_degree
                    .keys()
                    .filter(|name| !processed.contains(*name))
                    .copied()
                    .collect();
                return Err(OrchestratorError::DagCycleDetected(remaining.join(", ")));
            }

            for &name in &ready {
                processed.insert(name);
                in_degree.remove(name);
                for dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            result.push(ready.into_iter().map(str::to_string).collect());
        }

        Ok(result)
    }

    /// Get execution order
    pub fn execution_order(&self) -> &[Vec<String>] {
        &self.execution_order
    }

    /// Flattened parents-first order
    pub fn order(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Position of `table` in [`Self::order`]
    pub fn position(&self, table: &str) -> Option<usize> {
        self.order().iter().position(|t| *t == table)
    }

    pub fn dependencies(&self, table: &str) -> &[String] {
        self.tables
            .get(table)
            .map(|node| node.dependencies.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Human-readable execution plan
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, group) in self.execution_order.iter().enumerate() {
            if group.len() == 1 {
                plan.push_str(&format!("Phase {}: {}\n", i + 1, group[0]));
            } else {
                plan.push_str(&format!(
                    "Phase {}: {} (parallel)\n",
                    i + 1,
                    group.join(" ∥ ")
                ));
            }
        }
        plan
    }
}
