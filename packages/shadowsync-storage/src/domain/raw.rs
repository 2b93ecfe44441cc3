//! Raw attribute-value models mirroring upstream entities.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{Result, StorageError};

/// Sentinel marking a field that is present but empty.
pub const NONE_SENTINEL: &str = "None";

/// One row per upstream entity. Never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub entity_id: Uuid,
    pub entity_type: String,
}

impl RawRecord {
    pub fn new(entity_id: Uuid, entity_type: impl Into<String>) -> Self {
        Self {
            entity_id,
            entity_type: entity_type.into(),
        }
    }
}

/// One value of one attribute of a raw entity.
///
/// Scalar fields always use `value_index` 0; list fields use the element
/// position, contiguous from 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawField {
    pub entity_id: Uuid,
    pub field_name: String,
    pub value_index: u32,
    pub field_value: Option<String>,
}

impl RawField {
    /// Expand normalized values into indexed rows.
    pub fn rows_for(entity_id: Uuid, field_name: &str, values: &[String]) -> Vec<RawField> {
        values
            .iter()
            .enumerate()
            .map(|(index, value)| RawField {
                entity_id,
                field_name: field_name.to_string(),
                value_index: index as u32,
                field_value: Some(value.clone()),
            })
            .collect()
    }
}

/// Value read back from the raw store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Scalar(Option<String>),
    List(Vec<Option<String>>),
}

impl FieldValue {
    /// Build from stored rows; a single row reads back as a scalar.
    pub fn from_values(mut values: Vec<Option<String>>) -> Self {
        if values.len() == 1 {
            FieldValue::Scalar(values.remove(0))
        } else {
            FieldValue::List(values)
        }
    }

    /// First value with the `"None"` sentinel mapped to `None`.
    pub fn as_scalar(&self) -> Option<&str> {
        let value = match self {
            FieldValue::Scalar(v) => v.as_deref(),
            FieldValue::List(values) => values.first().and_then(|v| v.as_deref()),
        };
        value.filter(|v| *v != NONE_SENTINEL)
    }

    /// All values with empty sentinels removed.
    pub fn as_list(&self) -> Vec<&str> {
        let values: Vec<Option<&str>> = match self {
            FieldValue::Scalar(v) => vec![v.as_deref()],
            FieldValue::List(values) => values.iter().map(|v| v.as_deref()).collect(),
        };
        values
            .into_iter()
            .flatten()
            .filter(|v| *v != NONE_SENTINEL)
            .collect()
    }
}

/// A raw record together with all of its fields, ordered by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntity {
    pub record: RawRecord,
    pub fields: BTreeMap<String, Vec<Option<String>>>,
}

impl RawEntity {
    pub fn new(record: RawRecord) -> Self {
        Self {
            record,
            fields: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.entity_id
    }

    pub fn entity_type(&self) -> &str {
        &self.record.entity_type
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Raw field value; fails with `NotFound` when the field is absent.
    pub fn field(&self, name: &str) -> Result<FieldValue> {
        self.fields
            .get(name)
            .map(|values| FieldValue::from_values(values.clone()))
            .ok_or_else(|| StorageError::field_not_found(self.id(), name))
    }

    /// Scalar value; `Ok(None)` for the empty sentinel, `NotFound` if absent.
    pub fn scalar(&self, name: &str) -> Result<Option<&str>> {
        let values = self
            .fields
            .get(name)
            .ok_or_else(|| StorageError::field_not_found(self.id(), name))?;
        Ok(values
            .first()
            .and_then(|v| v.as_deref())
            .filter(|v| *v != NONE_SENTINEL))
    }

    /// List value with empty sentinels removed; `NotFound` if absent.
    pub fn list(&self, name: &str) -> Result<Vec<&str>> {
        let values = self
            .fields
            .get(name)
            .ok_or_else(|| StorageError::field_not_found(self.id(), name))?;
        Ok(values
            .iter()
            .filter_map(|v| v.as_deref())
            .filter(|v| *v != NONE_SENTINEL)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> RawEntity {
        let mut e = RawEntity::new(RawRecord::new(Uuid::nil(), "session"));
        e.fields
            .insert("subject".to_string(), vec![Some("u1".to_string())]);
        e.fields
            .insert("narrative".to_string(), vec![Some("None".to_string())]);
        e.fields.insert(
            "users".to_string(),
            vec![Some("a".to_string()), Some("b".to_string())],
        );
        e
    }

    #[test]
    fn test_scalar_access() {
        let e = entity();
        assert_eq!(e.scalar("subject").unwrap(), Some("u1"));
        assert_eq!(e.scalar("narrative").unwrap(), None);
        assert!(e.scalar("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_access() {
        let e = entity();
        assert_eq!(e.list("users").unwrap(), vec!["a", "b"]);
        assert!(e.list("narrative").unwrap().is_empty());
    }

    #[test]
    fn test_field_value_shapes() {
        let e = entity();
        assert_eq!(
            e.field("subject").unwrap(),
            FieldValue::Scalar(Some("u1".to_string()))
        );
        match e.field("users").unwrap() {
            FieldValue::List(values) => assert_eq!(values.len(), 2),
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_rows_for_indices_are_contiguous() {
        let rows = RawField::rows_for(
            Uuid::nil(),
            "users",
            &["x".to_string(), "y".to_string(), "z".to_string()],
        );
        let indices: Vec<u32> = rows.iter().map(|r| r.value_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
