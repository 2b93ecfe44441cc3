/// Reverse reference tracking for invalidation
///
/// - Reverse index: "which tables reference this table, through which key"
/// - BFS affected tables: transitive descendants of a set of tables
use shadowsync_storage::{ForeignKey, TableSchema};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// A child table and the foreign key through which it references a parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Referrer {
    pub table: String,
    pub foreign_key: ForeignKey,
}

/// Reverse reference index
///
/// Maps parent table → [child tables referencing it]
pub struct ReverseReferenceIndex {
    referrers: HashMap<String, Vec<Referrer>>,
}

impl ReverseReferenceIndex {
    pub fn new() -> Self {
        Self {
            referrers: HashMap::new(),
        }
    }

    pub fn from_schemas<'a>(schemas: impl IntoIterator<Item = &'a TableSchema>) -> Self {
        let mut index = Self::new();
        for schema in schemas {
            for fk in &schema.foreign_keys {
                index.add_reference(&schema.name, fk.clone());
            }
        }
        index
    }

    /// `child` references `fk.references` through `fk`
    pub fn add_reference(&mut self, child: &str, fk: ForeignKey) {
        self.referrers
            .entry(fk.references.clone())
            .or_default()
            .push(Referrer {
                table: child.to_string(),
                foreign_key: fk,
            });
    }

    /// Direct referrers of `table`, in registration order
    pub fn referencing(&self, table: &str) -> &[Referrer] {
        self.referrers
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Get total number of reference edges
    pub fn len(&self) -> usize {
        self.referrers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.referrers.is_empty()
    }
}

impl Default for ReverseReferenceIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute every table that transitively references one of `tables`
///
/// BFS over reverse edges, O(V+E). The starting tables are not included
/// unless they reference each other.
pub fn compute_affected_tables(
    tables: &[&str],
    index: &ReverseReferenceIndex,
) -> BTreeSet<String> {
    let mut affected = BTreeSet::new();
    let mut queue: VecDeque<String> = tables.iter().map(|t| t.to_string()).collect();
    let mut visited: BTreeSet<String> = queue.iter().cloned().collect();

    while let Some(table) = queue.pop_front() {
        for referrer in index.referencing(&table) {
            affected.insert(referrer.table.clone());
            if visited.insert(referrer.table.clone()) {
                queue.push_back(referrer.table.clone());
            }
        }
    }

    affected
}
