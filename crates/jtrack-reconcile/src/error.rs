use jtrack_storage::StorageError;
use thiserror::Error;

/// Rejected before any I/O is issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
    #[error("category `{category}` requires a {field}")]
    MissingScope { category: String, field: &'static str },
    #[error("category `{category}` does not accept a {field} filter")]
    UnsupportedScope { category: String, field: &'static str },
    #[error("limit must be at least 1")]
    ZeroLimit,
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
    #[error("category file: {0}")]
    CategoryFile(String),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("policy guard: {category} planned {planned} mutation(s), threshold is {threshold}")]
    PolicyGuardTriggered {
        category: String,
        planned: usize,
        threshold: usize,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    #[error("pass cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ReconcileError::PolicyGuardTriggered { .. } => 1,
            ReconcileError::Storage(_) => 2,
            ReconcileError::InvalidConfiguration(_) => 3,
            ReconcileError::Cancelled => 130,
        }
    }
}
