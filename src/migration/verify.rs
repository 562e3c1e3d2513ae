//! Integrity verification: checksums, stale locks, schema drift.
//!
//! Three independent checks; a finding in one never short-circuits the
//! others. Only checksum mismatches are errors. Nothing here ever blocks
//! execution; remediation is a separate, explicit caller action (except the
//! opt-in expired-lock cleanup).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::checksum::{calculate_checksum, verify_checksum};
use super::error::MigrationError;
use super::types::Environment;
use super::{lock, registry, snapshot};
use crate::TideExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueType {
    ChecksumMismatch,
    LockExpired,
    SchemaDrift,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::ChecksumMismatch => "checksum_mismatch",
            IssueType::LockExpired => "lock_expired",
            IssueType::SchemaDrift => "schema_drift",
        }
    }
}

/// One finding, human-readable detail included.
#[derive(Debug, Clone)]
pub struct IntegrityIssue {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub detail: String,
}

/// A registered script whose stored checksum no longer matches its content.
#[derive(Debug, Clone)]
pub struct ChecksumMismatch {
    pub migration_id: String,
    pub registered_checksum: String,
    pub calculated_checksum: String,
}

/// Live schema hash diverging from the most recent snapshot.
#[derive(Debug, Clone)]
pub struct SchemaDrift {
    pub snapshot_id: Uuid,
    pub snapshot_hash: String,
    pub current_hash: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub issues: Vec<IntegrityIssue>,
    pub checksum_mismatches: Vec<ChecksumMismatch>,
    pub schema_drift: Option<SchemaDrift>,
}

/// Runs all three checks for a database/environment. `fix_drift` deletes an
/// expired lock row when one is found; it never touches anything else.
pub fn verify_integrity(
    executor: &dyn TideExecutor,
    database_id: &str,
    environment: Environment,
    fix_drift: bool,
) -> Result<IntegrityReport, MigrationError> {
    #[cfg(feature = "tracing")]
    let _span = crate::metrics::tracing_helpers::verify_integrity_span(database_id).entered();

    let mut issues = Vec::new();

    let checksum_mismatches = check_checksums(executor, database_id, &mut issues)?;
    check_expired_lock(executor, database_id, fix_drift, &mut issues)?;
    let schema_drift = check_schema_drift(executor, database_id, environment, &mut issues)?;

    Ok(IntegrityReport {
        is_valid: no_error_issues(&issues),
        issues,
        checksum_mismatches,
        schema_drift,
    })
}

fn no_error_issues(issues: &[IntegrityIssue]) -> bool {
    !issues.iter().any(|issue| issue.severity == Severity::Error)
}

fn check_checksums(
    executor: &dyn TideExecutor,
    database_id: &str,
    issues: &mut Vec<IntegrityIssue>,
) -> Result<Vec<ChecksumMismatch>, MigrationError> {
    let mut mismatches = Vec::new();
    for migration in registry::list_migrations(executor, database_id)? {
        if verify_checksum(&migration.checksum, &migration.up_script) {
            continue;
        }
        let calculated = calculate_checksum(&migration.up_script);
        issues.push(IntegrityIssue {
            issue_type: IssueType::ChecksumMismatch,
            severity: Severity::Error,
            detail: format!(
                "migration '{}' was modified after registration: \
                 registered {}, calculated {}",
                migration.migration_id, migration.checksum, calculated
            ),
        });
        mismatches.push(ChecksumMismatch {
            migration_id: migration.migration_id,
            registered_checksum: migration.checksum,
            calculated_checksum: calculated,
        });
    }
    Ok(mismatches)
}

fn check_expired_lock(
    executor: &dyn TideExecutor,
    database_id: &str,
    fix_drift: bool,
    issues: &mut Vec<IntegrityIssue>,
) -> Result<(), MigrationError> {
    let Some(current) = lock::get_lock(executor, database_id)? else {
        return Ok(());
    };
    if !current.is_expired() {
        return Ok(());
    }

    let mut detail = format!(
        "lock held by '{}' expired at {}",
        current.locked_by, current.expires_at
    );
    if fix_drift {
        if lock::clear_expired_lock(executor, database_id)? {
            detail.push_str("; removed");
            log::info!("Removed expired migration lock on '{database_id}'");
        }
    } else {
        detail.push_str("; re-run with fix_drift to remove");
    }
    issues.push(IntegrityIssue {
        issue_type: IssueType::LockExpired,
        severity: Severity::Warning,
        detail,
    });
    Ok(())
}

fn check_schema_drift(
    executor: &dyn TideExecutor,
    database_id: &str,
    environment: Environment,
    issues: &mut Vec<IntegrityIssue>,
) -> Result<Option<SchemaDrift>, MigrationError> {
    // Nothing to compare against until a first snapshot exists.
    let Some((snapshot_id, snapshot_hash, captured_at)) =
        snapshot::latest_snapshot_hash(executor, database_id, environment)?
    else {
        return Ok(None);
    };

    let current_hash = snapshot::introspect_schema(executor)?.hash()?;
    if current_hash == snapshot_hash {
        return Ok(None);
    }

    issues.push(IntegrityIssue {
        issue_type: IssueType::SchemaDrift,
        severity: Severity::Warning,
        detail: format!(
            "live schema hash {current_hash} differs from snapshot {snapshot_id} \
             ({snapshot_hash}, captured {captured_at})"
        ),
    });
    Ok(Some(SchemaDrift {
        snapshot_id,
        snapshot_hash,
        current_hash,
        captured_at,
    }))
}
