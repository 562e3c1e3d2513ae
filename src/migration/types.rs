//! Core data model for the migration ledger.
//!
//! Row-mapping constructors take columns in the canonical order used by the
//! queries in this crate; callers select explicit column lists, never `*`.

use chrono::{DateTime, Utc};
use may_postgres::Row;
use serde::Serialize;
use uuid::Uuid;

use super::error::MigrationError;

/// Deployment target. The system recognizes exactly two physical targets;
/// the legacy `staging` value is normalized to `Dev` on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    pub const ALL: [Environment; 2] = [Environment::Dev, Environment::Prod];

    pub fn parse(value: &str) -> Result<Self, MigrationError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "staging" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            other => Err(MigrationError::Validation(format!(
                "unknown environment '{other}': expected dev, staging, or prod"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single execution-history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

/// Direction of an execution: forward applies `up_script`, rollback applies
/// `down_script`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Forward,
    Rollback,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Forward => "forward",
            ExecutionMode::Rollback => "rollback",
        }
    }
}

/// How a schema snapshot came to be captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureType {
    /// Captured by the engine after a successful migration run.
    Auto,
    /// Requested explicitly by a caller.
    Manual,
}

impl CaptureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureType::Auto => "auto",
            CaptureType::Manual => "manual",
        }
    }
}

/// Audit-log event kinds, written on every execution transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
    RolledBack,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Started => "started",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::RolledBack => "rolled-back",
        }
    }
}

/// A registered schema-change script. Immutable once written; the checksum
/// covers `up_script` and is never recomputed in place.
#[derive(Debug, Clone, Serialize)]
pub struct Migration {
    pub database_id: String,
    pub migration_id: String,
    pub description: String,
    pub up_script: String,
    pub down_script: Option<String>,
    pub checksum: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub is_reversible: bool,
    pub depends_on: Vec<String>,
    pub tags: Vec<String>,
}

impl Migration {
    /// Columns: database_id, migration_id, description, up_script,
    /// down_script, checksum, author, created_at, is_reversible, depends_on,
    /// tags.
    pub fn from_row(row: &Row) -> Self {
        Self {
            database_id: row.get(0),
            migration_id: row.get(1),
            description: row.get(2),
            up_script: row.get(3),
            down_script: row.get(4),
            checksum: row.get(5),
            author: row.get(6),
            created_at: row.get(7),
            is_reversible: row.get(8),
            depends_on: row.get(9),
            tags: row.get(10),
        }
    }
}

/// Applied-state of one migration in one environment. One row per
/// `(migration_id, database_id, environment)` once first written; only the
/// execution engine mutates it.
#[derive(Debug, Clone)]
pub struct AppliedStatus {
    pub migration_id: String,
    pub database_id: String,
    pub environment: Environment,
    pub is_applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: String,
    pub last_execution_id: Uuid,
}

impl AppliedStatus {
    /// Columns: migration_id, database_id, environment, is_applied,
    /// applied_at, applied_by, last_execution_id.
    ///
    /// Ledger rows written before the two-environment model may still carry
    /// `staging`; parsing normalizes it to `dev`.
    pub fn from_row(row: &Row) -> Result<Self, MigrationError> {
        let environment: String = row.get(2);
        Ok(Self {
            migration_id: row.get(0),
            database_id: row.get(1),
            environment: Environment::parse(&environment)?,
            is_applied: row.get(3),
            applied_at: row.get(4),
            applied_by: row.get(5),
            last_execution_id: row.get(6),
        })
    }
}

/// Advisory, time-boxed mutual-exclusion marker. At most one row per
/// database; readers treat rows past `expires_at` as absent.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    pub database_id: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MigrationLock {
    /// Columns: database_id, locked_by, locked_at, expires_at.
    pub fn from_row(row: &Row) -> Self {
        Self {
            database_id: row.get(0),
            locked_by: row.get(1),
            locked_at: row.get(2),
            expires_at: row.get(3),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_environment_parse_normalizes_staging() {
        assert_eq!(Environment::parse("dev").unwrap(), Environment::Dev);
        assert_eq!(Environment::parse("staging").unwrap(), Environment::Dev);
        assert_eq!(Environment::parse("prod").unwrap(), Environment::Prod);
        assert_eq!(Environment::parse(" Prod ").unwrap(), Environment::Prod);
    }

    #[test]
    fn test_environment_parse_rejects_unknown() {
        let err = Environment::parse("qa").unwrap_err();
        assert!(matches!(err, MigrationError::Validation(_)));
        assert!(err.to_string().contains("qa"));
    }

    #[test]
    fn test_enum_wire_strings() {
        assert_eq!(ExecutionStatus::Running.as_str(), "running");
        assert_eq!(ExecutionMode::Rollback.as_str(), "rollback");
        assert_eq!(CaptureType::Auto.as_str(), "auto");
        assert_eq!(EventType::RolledBack.as_str(), "rolled-back");
        assert_eq!(Environment::Prod.to_string(), "prod");
    }

    #[test]
    fn test_lock_expiry() {
        let mut lock = MigrationLock {
            database_id: "db".to_string(),
            locked_by: "worker".to_string(),
            locked_at: Utc::now() - Duration::minutes(40),
            expires_at: Utc::now() - Duration::minutes(10),
        };
        assert!(lock.is_expired());

        lock.expires_at = Utc::now() + Duration::minutes(10);
        assert!(!lock.is_expired());
    }
}
