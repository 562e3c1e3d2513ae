//! Integration tests for snapshots, status reporting, and integrity checks
//!
//! Runs against a real PostgreSQL server and exercises the read-only side of
//! the ledger: schema introspection hashing, the per-environment status
//! matrix, checksum tamper detection, drift detection, and expired-lock
//! cleanup.

mod common;

use tidemark::migration::{
    lock, CaptureType, Environment, IssueType, MigrationDraft, MigrationState, Migrator,
    MigratorOptions, RunOptions, Severity,
};
use tidemark::TideExecutor;

fn new_migrator(dir: &tempfile::TempDir) -> Migrator {
    let executor = common::clean_executor();
    let mut options = MigratorOptions::default();
    options.migrations_dir = dir.path().to_path_buf();
    options.auto_snapshot = false;
    Migrator::new(executor, options)
}

fn draft(name: &str, database: &str, up: &str) -> MigrationDraft {
    MigrationDraft::new(name, database, "integration-suite").with_up_script(up)
}

fn run_options() -> RunOptions {
    RunOptions::new(Environment::Dev, "integration-suite")
}

#[test]
fn test_snapshot_capture_and_hash_stability() {
    let _guard = common::serialize_test();
    let executor = common::clean_executor();
    executor
        .execute(
            "CREATE TABLE snapshot_subject (id BIGSERIAL PRIMARY KEY, label TEXT)",
            &[],
        )
        .expect("Failed to create scratch table");
    let migrator = Migrator::new(executor, MigratorOptions::default());

    let first = migrator
        .capture_snapshot("snapdb", Environment::Dev, CaptureType::Manual, None, "tester")
        .expect("First capture should succeed");
    let second = migrator
        .capture_snapshot("snapdb", Environment::Dev, CaptureType::Manual, None, "tester")
        .expect("Second capture should succeed");

    // An unchanged schema hashes identically across captures
    assert_eq!(first.schema_hash, second.schema_hash);
    assert_ne!(first.snapshot_id, second.snapshot_id);
    assert!(first.table_count >= 1, "Scratch table should be counted");
    assert!(first.backup_document_id.is_none(), "No mirror configured");

    // Any schema change produces a different hash
    migrator
        .executor()
        .execute("ALTER TABLE snapshot_subject ADD COLUMN note TEXT", &[])
        .expect("Failed to alter scratch table");
    let third = migrator
        .capture_snapshot("snapdb", Environment::Dev, CaptureType::Manual, None, "tester")
        .expect("Third capture should succeed");
    assert_ne!(third.schema_hash, first.schema_hash);

    // All three captures are in the ledger
    let row = migrator
        .executor()
        .query_one(
            "SELECT COUNT(*) FROM tidemark_snapshots WHERE database_id = $1",
            &[&"snapdb"],
        )
        .expect("Failed to count snapshots");
    let count: i64 = row.get(0);
    assert_eq!(count, 3);

    let _ = migrator
        .executor()
        .execute("DROP TABLE IF EXISTS snapshot_subject CASCADE", &[]);
}

#[test]
fn test_checksum_tamper_detection() {
    let _guard = common::serialize_test();
    let scripts = tempfile::tempdir().expect("Failed to create scripts directory");
    let migrator = new_migrator(&scripts);

    let created = migrator
        .create_migration(draft(
            "m1 audited",
            "auditdb",
            "CREATE TABLE audited (id INT)",
        ))
        .expect("Failed to register migration");
    migrator
        .run_migrations("auditdb", &run_options())
        .expect("Run should succeed");

    // A clean ledger verifies with no issues
    let report = migrator
        .verify("auditdb", Environment::Dev, false)
        .expect("Verify should succeed");
    assert!(report.is_valid, "Issues found: {:?}", report.issues);
    assert!(report.checksum_mismatches.is_empty());

    // Edit the registered script behind the engine's back
    migrator
        .executor()
        .execute(
            "UPDATE tidemark_migrations SET up_script = up_script || ' -- tampered' \
             WHERE migration_id = $1",
            &[&created.migration_id],
        )
        .expect("Failed to tamper with script");

    let report = migrator
        .verify("auditdb", Environment::Dev, false)
        .expect("Verify should succeed");
    assert!(!report.is_valid, "Tampering must invalidate the ledger");
    assert_eq!(report.checksum_mismatches.len(), 1);
    let mismatch = &report.checksum_mismatches[0];
    assert_eq!(mismatch.migration_id, created.migration_id);
    assert_ne!(mismatch.registered_checksum, mismatch.calculated_checksum);

    let issue = report
        .issues
        .iter()
        .find(|issue| issue.issue_type == IssueType::ChecksumMismatch)
        .expect("Checksum issue should be reported");
    assert_eq!(issue.severity, Severity::Error);

    let _ = migrator
        .executor()
        .execute("DROP TABLE IF EXISTS audited CASCADE", &[]);
}

#[test]
fn test_schema_drift_detection() {
    let _guard = common::serialize_test();
    let scripts = tempfile::tempdir().expect("Failed to create scripts directory");
    let migrator = new_migrator(&scripts);

    migrator
        .create_migration(draft(
            "m1 tracked",
            "driftdb",
            "CREATE TABLE tracked (id INT)",
        ))
        .expect("Failed to register migration");
    migrator
        .run_migrations("driftdb", &run_options())
        .expect("Run should succeed");
    migrator
        .capture_snapshot("driftdb", Environment::Dev, CaptureType::Manual, None, "tester")
        .expect("Capture should succeed");

    // In sync right after the capture
    let report = migrator
        .verify("driftdb", Environment::Dev, false)
        .expect("Verify should succeed");
    assert!(report.schema_drift.is_none());

    // A change the engine never saw
    migrator
        .executor()
        .execute("CREATE TABLE drift_extra (id INT)", &[])
        .expect("Failed to create out-of-band table");

    let report = migrator
        .verify("driftdb", Environment::Dev, false)
        .expect("Verify should succeed");
    let drift = report.schema_drift.as_ref().expect("Drift should be detected");
    assert_ne!(drift.snapshot_hash, drift.current_hash);

    let issue = report
        .issues
        .iter()
        .find(|issue| issue.issue_type == IssueType::SchemaDrift)
        .expect("Drift issue should be reported");
    assert_eq!(issue.severity, Severity::Warning);
    assert!(report.is_valid, "Drift warns without invalidating the ledger");

    let _ = migrator
        .executor()
        .execute("DROP TABLE IF EXISTS tracked, drift_extra CASCADE", &[]);
}

#[test]
fn test_expired_lock_cleanup() {
    let _guard = common::serialize_test();
    let executor = common::clean_executor();

    assert!(lock::try_acquire_lock(&executor, "cleandb", "crashed-runner", -1)
        .expect("Failed to acquire lock"));
    let migrator = Migrator::new(executor, MigratorOptions::default());

    // Report only: the expired lock is flagged but left in place
    let report = migrator
        .verify("cleandb", Environment::Dev, false)
        .expect("Verify should succeed");
    let issue = report
        .issues
        .iter()
        .find(|issue| issue.issue_type == IssueType::LockExpired)
        .expect("Expired lock should be reported");
    assert_eq!(issue.severity, Severity::Warning);
    assert!(report.is_valid);
    assert!(lock::get_lock(migrator.executor(), "cleandb")
        .expect("Failed to query lock")
        .is_some());

    // With fix_drift the stale row is removed
    let report = migrator
        .verify("cleandb", Environment::Dev, true)
        .expect("Verify should succeed");
    assert!(report
        .issues
        .iter()
        .any(|issue| issue.issue_type == IssueType::LockExpired));
    assert!(lock::get_lock(migrator.executor(), "cleandb")
        .expect("Failed to query lock")
        .is_none());

    // And the next verify is clean
    let report = migrator
        .verify("cleandb", Environment::Dev, false)
        .expect("Verify should succeed");
    assert!(report.issues.is_empty());
}

#[test]
fn test_status_matrix() {
    let _guard = common::serialize_test();
    let scripts = tempfile::tempdir().expect("Failed to create scripts directory");
    let migrator = new_migrator(&scripts);

    let first = migrator
        .create_migration(draft(
            "m1 applied in dev",
            "statusdb",
            "CREATE TABLE status_one (id INT)",
        ))
        .expect("Failed to register first migration");
    migrator
        .create_migration(draft(
            "m2 still pending",
            "statusdb",
            "CREATE TABLE status_two (id INT)",
        ))
        .expect("Failed to register second migration");

    // Apply only the first, only in dev
    migrator
        .run_migrations("statusdb", &run_options().with_target(&first.migration_id))
        .expect("Run should succeed");

    let statuses = migrator
        .status(Some("statusdb"), Some(Environment::Dev))
        .expect("Status should succeed");
    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];
    assert_eq!(status.database_id, "statusdb");
    assert_eq!(status.total_migrations, 2);
    assert_eq!(status.applied_migrations, 1);
    assert_eq!(status.pending_migrations, 1);
    assert!(!status.is_up_to_date());
    assert!(status.last_migration_at.is_some());

    // The matrix carries both environments regardless of the filter
    assert_eq!(status.migrations[0].migration_id, first.migration_id);
    assert_eq!(status.migrations[0].dev, MigrationState::Applied);
    assert_eq!(status.migrations[0].prod, MigrationState::Pending);
    assert_eq!(status.migrations[1].dev, MigrationState::Pending);

    // Counts follow the requested environment
    let statuses = migrator
        .status(Some("statusdb"), Some(Environment::Prod))
        .expect("Status should succeed");
    assert_eq!(statuses[0].applied_migrations, 0);
    assert_eq!(statuses[0].pending_migrations, 2);
    assert!(statuses[0].last_migration_at.is_none());

    let _ = migrator
        .executor()
        .execute("DROP TABLE IF EXISTS status_one, status_two CASCADE", &[]);
}

#[test]
fn test_auto_snapshot_after_run() {
    let _guard = common::serialize_test();
    let scripts = tempfile::tempdir().expect("Failed to create scripts directory");
    let executor = common::clean_executor();
    let mut options = MigratorOptions::default();
    options.migrations_dir = scripts.path().to_path_buf();
    options.auto_snapshot = true;
    let migrator = Migrator::new(executor, options);

    let created = migrator
        .create_migration(draft(
            "m1 with snapshot",
            "autodb",
            "CREATE TABLE auto_snap (id INT)",
        ))
        .expect("Failed to register migration");
    let result = migrator
        .run_migrations("autodb", &run_options())
        .expect("Run should succeed");
    assert!(result.success);

    // The run left a snapshot tied to the last executed migration
    let row = migrator
        .executor()
        .query_one(
            "SELECT COUNT(*) FROM tidemark_snapshots \
             WHERE database_id = $1 AND capture_type = 'auto' \
             AND triggering_migration_id = $2",
            &[&"autodb", &created.migration_id],
        )
        .expect("Failed to count snapshots");
    let count: i64 = row.get(0);
    assert_eq!(count, 1);

    // A run that executes nothing captures nothing
    migrator
        .run_migrations("autodb", &run_options())
        .expect("Idle run should succeed");
    let row = migrator
        .executor()
        .query_one(
            "SELECT COUNT(*) FROM tidemark_snapshots WHERE database_id = $1",
            &[&"autodb"],
        )
        .expect("Failed to count snapshots");
    let count: i64 = row.get(0);
    assert_eq!(count, 1);

    let _ = migrator
        .executor()
        .execute("DROP TABLE IF EXISTS auto_snap CASCADE", &[]);
}
