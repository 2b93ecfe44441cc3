use shadowsync_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Fatal pipeline errors. Anything here aborts the run.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Table dependency cycle detected among: {0}")]
    DagCycleDetected(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn mapping<E: std::fmt::Display>(e: E) -> Self {
        Self::Mapping(e.to_string())
    }

    pub fn snapshot<E: std::fmt::Display>(e: E) -> Self {
        Self::Snapshot(e.to_string())
    }
}

/// Per-entity failure. Caught at the entity boundary, counted and reported;
/// never aborts a stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    /// Referenced row not resolved yet; retried on the next run
    #[error("missing dependency: {table} row for '{key}' is not resolved yet")]
    MissingDependency { table: String, key: String },

    /// Raw payload is internally inconsistent; permanently skipped
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    /// Referenced entity is confirmed absent; permanently skipped
    #[error("referential violation: {table} row for '{key}' does not exist")]
    ReferentialViolation { table: String, key: String },

    /// Backend rejected the write or lookup
    #[error("transient write failure: {0}")]
    TransientWrite(String),
}

impl EntityError {
    pub fn missing(table: &str, key: &str) -> Self {
        Self::MissingDependency {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn referential(table: &str, key: &str) -> Self {
        Self::ReferentialViolation {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EntityError::MissingDependency { .. } | EntityError::TransientWrite(_) => {
                ErrorCategory::Transient
            }
            EntityError::DataIntegrity(_) | EntityError::ReferentialViolation { .. } => {
                ErrorCategory::Permanent
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EntityError::MissingDependency { .. } => "missing_dependency",
            EntityError::DataIntegrity(_) => "data_integrity",
            EntityError::ReferentialViolation { .. } => "referential_violation",
            EntityError::TransientWrite(_) => "transient_write",
        }
    }
}

impl From<StorageError> for EntityError {
    fn from(err: StorageError) -> Self {
        EntityError::TransientWrite(err.to_string())
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retried on the next run
    Transient,
    /// Permanent error - don't retry until the source data changes
    Permanent,
    /// Infrastructure error - alert ops (e.g., disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let s = category.as_str();
            let parsed = ErrorCategory::from_str(s).unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!(ErrorCategory::from_str("invalid").is_err());
    }

    #[test]
    fn test_entity_error_categories() {
        assert_eq!(
            EntityError::missing("session", "s9").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            EntityError::TransientWrite("busy".into()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            EntityError::integrity("lengths differ").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            EntityError::referential("subject", "u1").category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_storage_error_is_transient_for_entities() {
        let err: EntityError = StorageError::database("locked").into();
        assert_eq!(err.kind(), "transient_write");
    }
}
