//! Error types for KEYSTONE operations

use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The backing relation does not exist yet. Only expected during early
    /// startup before schema sync has created it; the only retried kind.
    #[error("Relation does not exist: {relation}")]
    RelationMissing { relation: String },

    #[error("Setting not found: {field}")]
    NotFound { field: String },

    #[error("Migration already recorded: {name}")]
    DuplicateMigration { name: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Whether this error means the schema has not been created yet.
    /// Callers retry on this kind and nothing else.
    pub fn is_relation_missing(&self) -> bool {
        matches!(self, StorageError::RelationMissing { .. })
    }
}

/// Migration orchestration errors. Distinct from connectivity errors so the
/// bootstrap caller can tell a failed unit apart from a flaky store.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration unit '{unit}' from module '{module}' failed: {source}")]
    UnitFailed {
        unit: String,
        module: String,
        #[source]
        source: Box<KeystoneError>,
    },

    #[error("A migration run is already in flight")]
    AlreadyRunning,

    #[error("No registered unit named '{name}'")]
    UnknownUnit { name: String },

    #[error("Migration ledger unavailable: {reason}")]
    LedgerUnavailable { reason: String },
}

/// Validation errors for setting writes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field key '{field}' is {len} characters, maximum is {max}")]
    FieldTooLong {
        field: String,
        len: usize,
        max: usize,
    },

    #[error("Field key must not be empty")]
    FieldEmpty,
}

/// Master error type for all KEYSTONE errors.
#[derive(Debug, Error)]
pub enum KeystoneError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl KeystoneError {
    /// Whether the underlying cause is the schema-not-ready condition.
    pub fn is_relation_missing(&self) -> bool {
        matches!(self, KeystoneError::Storage(e) if e.is_relation_missing())
    }
}

/// Result type alias for KEYSTONE operations.
pub type KeystoneResult<T> = Result<T, KeystoneError>;

// =============================================================================
// TESTS
// =============================================================================
