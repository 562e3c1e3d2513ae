//! Migration-specific error types

use crate::TideError;

/// Migration-specific errors
#[derive(Debug)]
pub enum MigrationError {
    /// Database execution error
    Database(TideError),
    /// A required field is missing or malformed; rejected before any side effect
    Validation(String),
    /// The ledger write for a new migration failed
    Registration(String),
    /// Another holder owns the migration lock for this database
    LockContention {
        database_id: String,
        held_by: String,
    },
    /// Migration id does not match the `YYYYMMDD_HHMMSS_<name>` format
    InvalidId(String),
    /// Document or context (de)serialization failed
    Serialization(serde_json::Error),
    /// Filesystem error while writing a migration script file
    Io(String),
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "Database error: {e}"),
            MigrationError::Validation(msg) => write!(f, "Validation error: {msg}"),
            MigrationError::Registration(msg) => write!(f, "Migration registration failed: {msg}"),
            MigrationError::LockContention {
                database_id,
                held_by,
            } => {
                write!(
                    f,
                    "Migration lock for database '{database_id}' is held by '{held_by}'.\n\
                     Another process may be running migrations. If this persists, check for:\n\
                     - A stuck migration process\n\
                     - A crashed holder (the lock expires on its own)\n\
                     - A stale row in the tidemark_locks table"
                )
            }
            MigrationError::InvalidId(id) => {
                write!(
                    f,
                    "Invalid migration id '{id}': expected YYYYMMDD_HHMMSS_<name>"
                )
            }
            MigrationError::Serialization(e) => write!(f, "Serialization error: {e}"),
            MigrationError::Io(msg) => write!(f, "File error: {msg}"),
        }
    }
}

impl std::error::Error for MigrationError {}

impl From<TideError> for MigrationError {
    fn from(error: TideError) -> Self {
        MigrationError::Database(error)
    }
}

impl From<crate::transaction::TransactionError> for MigrationError {
    fn from(error: crate::transaction::TransactionError) -> Self {
        MigrationError::Database(error.into())
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(error: serde_json::Error) -> Self {
        MigrationError::Serialization(error)
    }
}
