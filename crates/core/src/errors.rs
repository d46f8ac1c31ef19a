//! Error types for the changekit core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type.

use rusqlite::ErrorCode;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer and every operation built on it.
///
/// Operations either succeed completely or return one of these with the
/// surrounding transaction rolled back.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A referenced branch, change, snapshot, or conflict does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A uniqueness constraint was violated and not absorbed by an idempotent
    /// insert.
    #[error("{entity} conflict: {detail}")]
    Conflict { entity: String, detail: String },

    /// The store aborted the transaction (busy or locked). Nothing was
    /// written; the caller may retry.
    #[error("transaction failed: {0}")]
    TransactionFailure(String),

    /// The caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying rusqlite error not covered by a more specific variant.
    #[error("database error: {0}")]
    SqliteError(rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// Snapshot content could not be (de)serialized.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DatabaseError {
    /// Shorthand for a [`DatabaseError::NotFound`].
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    /// Whether the failure is transient and the whole operation can be
    /// retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionFailure(_))
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::TransactionFailure(err.to_string())
            }
            Some(ErrorCode::ConstraintViolation) => Self::Conflict {
                entity: "constraint".into(),
                detail: err.to_string(),
            },
            _ => Self::SqliteError(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
