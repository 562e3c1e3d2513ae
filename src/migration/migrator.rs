//! Execution engine: orchestrates forward and rollback runs.
//!
//! One `Migrator` owns one executor handle and one options set; callers
//! construct it explicitly and drop (or `close`) it when done. Every run
//! takes the per-database lock first and releases it on every path out.

use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::error::MigrationError;
use super::events::record_event;
use super::ids;
use super::lock::LockGuard;
use super::registry::{self, CreatedMigration, MigrationDraft};
use super::snapshot::{self, SnapshotResult};
use super::state_table;
use super::status::{self, DatabaseStatus};
use super::types::{
    CaptureType, Environment, EventType, ExecutionMode, ExecutionStatus, Migration,
};
use super::verify::{self, IntegrityReport};
use crate::config::TidemarkConfig;
use crate::store::Replicator;
use crate::{MayPostgresExecutor, TideExecutor};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Tunables for a `Migrator`, decided once at construction.
pub struct MigratorOptions {
    /// Lock expiry. The liveness safety valve against a crashed holder;
    /// must exceed the statement timeout.
    pub lock_timeout_minutes: i64,
    /// `SET LOCAL statement_timeout` for each per-migration transaction.
    pub statement_timeout_seconds: u64,
    /// Root directory for working-copy script files.
    pub migrations_dir: PathBuf,
    /// Capture a schema snapshot after each successful non-dry run.
    pub auto_snapshot: bool,
    /// Mirror replication worker. `None` disables mirroring entirely.
    pub replicator: Option<Replicator>,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            lock_timeout_minutes: 30,
            statement_timeout_seconds: 300,
            migrations_dir: PathBuf::from("./migrations"),
            auto_snapshot: true,
            replicator: None,
        }
    }
}

impl MigratorOptions {
    /// Options from loaded configuration. The replicator is attached
    /// separately since it owns a worker.
    pub fn from_config(config: &TidemarkConfig) -> Self {
        Self {
            lock_timeout_minutes: config.migrations.lock_timeout_minutes,
            statement_timeout_seconds: config.migrations.statement_timeout_seconds,
            migrations_dir: PathBuf::from(&config.migrations.directory),
            auto_snapshot: config.migrations.auto_snapshot,
            replicator: None,
        }
    }

    pub fn with_replicator(mut self, replicator: Replicator) -> Self {
        self.replicator = Some(replicator);
        self
    }
}

/// Per-invocation inputs for a forward run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub environment: Environment,
    /// Who is running; also the lock owner and `applied_by` value.
    pub executed_by: String,
    /// Inclusive upper bound; pending migrations beyond it are skipped.
    pub target_migration_id: Option<String>,
    /// Plan without mutating: pending migrations are reported as skipped.
    pub dry_run: bool,
    /// Free-form context recorded with executions and events.
    pub context: Option<Value>,
}

impl RunOptions {
    pub fn new(environment: Environment, executed_by: &str) -> Self {
        Self {
            environment,
            executed_by: executed_by.to_string(),
            target_migration_id: None,
            dry_run: false,
            context: None,
        }
    }

    pub fn with_target(mut self, target_migration_id: &str) -> Self {
        self.target_migration_id = Some(target_migration_id.to_string());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Per-invocation inputs for a rollback.
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    pub environment: Environment,
    pub executed_by: String,
    pub context: Option<Value>,
}

impl RollbackOptions {
    pub fn new(environment: Environment, executed_by: &str) -> Self {
        Self {
            environment,
            executed_by: executed_by.to_string(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Why a pending migration was not executed in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Beyond the requested target migration id.
    BeyondTarget,
    /// A `depends_on` entry is not applied in this environment.
    UnmetDependency(String),
    /// Dry run; nothing executes.
    DryRun,
    /// An earlier migration in this batch failed.
    BatchAborted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::BeyondTarget => write!(f, "beyond target migration"),
            SkipReason::UnmetDependency(dep) => {
                write!(f, "dependency '{dep}' is not applied")
            }
            SkipReason::DryRun => write!(f, "dry run"),
            SkipReason::BatchAborted => write!(f, "earlier migration in the batch failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedMigration {
    pub migration_id: String,
    pub reason: SkipReason,
}

/// A migration this run actually attempted, successful or not.
#[derive(Debug, Clone)]
pub struct ExecutedMigration {
    pub migration_id: String,
    pub status: ExecutionStatus,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// Outcome of a forward run. `success` means no migration failed; a run
/// where everything was skipped is still a success.
#[derive(Debug, Clone)]
pub struct MigrationRunResult {
    pub success: bool,
    pub executed_migrations: Vec<ExecutedMigration>,
    pub skipped_migrations: Vec<SkippedMigration>,
    pub failed_migration: Option<String>,
    pub total_duration_ms: i64,
}

/// Outcome of a rollback. Precondition violations come back here as
/// failures with a descriptive error, not as `Err`.
#[derive(Debug, Clone)]
pub struct RollbackResult {
    pub success: bool,
    pub migration_id: String,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// The engine. Owns its executor handle for the duration of its life.
pub struct Migrator {
    executor: MayPostgresExecutor,
    options: MigratorOptions,
}

impl Migrator {
    pub fn new(executor: MayPostgresExecutor, options: MigratorOptions) -> Self {
        Self { executor, options }
    }

    /// The underlying executor, for callers that need raw queries alongside
    /// engine operations.
    pub fn executor(&self) -> &dyn TideExecutor {
        &self.executor
    }

    /// Drains and joins the mirror replication worker, then drops the
    /// connection handle.
    pub fn close(self) {
        if let Some(replicator) = self.options.replicator {
            replicator.close();
        }
    }

    /// Creates all ledger tables and indexes. Idempotent.
    pub fn initialize_ledger(&self) -> Result<(), MigrationError> {
        state_table::initialize_ledger(&self.executor)
    }

    /// Registers a new migration; see `registry::create_migration`.
    pub fn create_migration(
        &self,
        draft: MigrationDraft,
    ) -> Result<CreatedMigration, MigrationError> {
        registry::create_migration(
            &self.executor,
            draft,
            &self.options.migrations_dir,
            self.options.replicator.as_ref(),
        )
    }

    /// Applies pending migrations for a database in ascending id order,
    /// each inside its own transaction, stopping the whole batch at the
    /// first failure. Fails with `LockContention` before touching anything
    /// when another holder owns the lock.
    pub fn run_migrations(
        &self,
        database_id: &str,
        options: &RunOptions,
    ) -> Result<MigrationRunResult, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::run_migrations_span(
            database_id,
            options.environment.as_str(),
        )
        .entered();

        if let Some(target) = &options.target_migration_id {
            ids::validate_migration_id(target)?;
        }

        let start = Instant::now();
        let guard = LockGuard::acquire(
            &self.executor,
            database_id,
            &options.executed_by,
            self.options.lock_timeout_minutes,
        )?;
        let outcome = self.run_batch(database_id, options);
        if let Err(e) = guard.release() {
            log::warn!("Failed to release migration lock on '{database_id}': {e}");
        }

        let mut result = outcome?;
        result.total_duration_ms = start.elapsed().as_millis() as i64;
        log::info!(
            "Migration run for '{database_id}' ({}): {} executed, {} skipped, success={}",
            options.environment,
            result.executed_migrations.len(),
            result.skipped_migrations.len(),
            result.success
        );

        if self.options.auto_snapshot && result.success && !options.dry_run {
            if let Some(last) = result.executed_migrations.last() {
                if let Err(e) = self.capture_snapshot(
                    database_id,
                    options.environment,
                    CaptureType::Auto,
                    Some(&last.migration_id),
                    &options.executed_by,
                ) {
                    log::warn!("Snapshot after migration run failed: {e}");
                }
            }
        }

        Ok(result)
    }

    fn run_batch(
        &self,
        database_id: &str,
        options: &RunOptions,
    ) -> Result<MigrationRunResult, MigrationError> {
        let pending = registry::load_pending(&self.executor, database_id, options.environment)?;
        let mut applied =
            registry::applied_migration_ids(&self.executor, database_id, options.environment)?;

        let mut executed_migrations = Vec::new();
        let mut skipped_migrations = Vec::new();
        let mut failed_migration: Option<String> = None;

        for migration in &pending {
            let skip = |reason: SkipReason| SkippedMigration {
                migration_id: migration.migration_id.clone(),
                reason,
            };

            if failed_migration.is_some() {
                skipped_migrations.push(skip(SkipReason::BatchAborted));
                continue;
            }
            if let Some(target) = &options.target_migration_id {
                if migration.migration_id.as_str() > target.as_str() {
                    skipped_migrations.push(skip(SkipReason::BeyondTarget));
                    continue;
                }
            }
            if let Some(dep) = migration
                .depends_on
                .iter()
                .find(|dep| !applied.contains(dep.as_str()))
            {
                log::warn!(
                    "Skipping '{}': dependency '{dep}' is not applied in {}",
                    migration.migration_id,
                    options.environment
                );
                skipped_migrations.push(skip(SkipReason::UnmetDependency(dep.clone())));
                continue;
            }
            if options.dry_run {
                skipped_migrations.push(skip(SkipReason::DryRun));
                continue;
            }

            let outcome = self.apply_migration(migration, options)?;
            if outcome.status == ExecutionStatus::Success {
                applied.insert(migration.migration_id.clone());
            } else {
                failed_migration = Some(migration.migration_id.clone());
            }
            executed_migrations.push(outcome);
        }

        Ok(MigrationRunResult {
            success: failed_migration.is_none(),
            executed_migrations,
            skipped_migrations,
            failed_migration,
            total_duration_ms: 0,
        })
    }

    /// Runs one migration's up script. Script failures come back as a
    /// `Failed` outcome; only ledger bookkeeping failures are `Err`.
    fn apply_migration(
        &self,
        migration: &Migration,
        options: &RunOptions,
    ) -> Result<ExecutedMigration, MigrationError> {
        log::info!("Applying migration '{}'", migration.migration_id);
        record_event(
            &self.executor,
            &migration.migration_id,
            &migration.database_id,
            EventType::Started,
            options.environment,
            options.context.as_ref(),
        );

        let execution_id = Uuid::new_v4();
        self.insert_execution(
            execution_id,
            &migration.migration_id,
            &migration.database_id,
            options.environment,
            &options.executed_by,
            options.context.as_ref(),
            ExecutionMode::Forward,
        )?;

        let start = Instant::now();
        match self.execute_script(&migration.up_script) {
            Ok(()) => {
                let duration = start.elapsed();
                let duration_ms = duration.as_millis() as i64;
                // The audit event goes out even when the bookkeeping rows
                // fail to land; history must survive a partially broken
                // ledger.
                let bookkeeping = self
                    .complete_execution(execution_id, ExecutionStatus::Success, duration_ms, None)
                    .and_then(|()| {
                        self.update_applied_status(
                            migration,
                            options.environment,
                            &options.executed_by,
                            execution_id,
                            true,
                        )
                    });
                record_event(
                    &self.executor,
                    &migration.migration_id,
                    &migration.database_id,
                    EventType::Completed,
                    options.environment,
                    options.context.as_ref(),
                );
                #[cfg(feature = "metrics")]
                METRICS.record_migration_executed(duration);
                log::info!(
                    "Applied '{}' in {duration_ms}ms",
                    migration.migration_id
                );
                bookkeeping?;
                Ok(ExecutedMigration {
                    migration_id: migration.migration_id.clone(),
                    status: ExecutionStatus::Success,
                    duration_ms,
                    error: None,
                })
            }
            Err(e) => {
                let duration_ms = start.elapsed().as_millis() as i64;
                let message = e.to_string();
                let bookkeeping = self.complete_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    duration_ms,
                    Some(&message),
                );
                record_event(
                    &self.executor,
                    &migration.migration_id,
                    &migration.database_id,
                    EventType::Failed,
                    options.environment,
                    Some(&failure_context(&message, options.context.as_ref())),
                );
                #[cfg(feature = "metrics")]
                METRICS.record_migration_failed();
                log::error!(
                    "Migration '{}' failed after {duration_ms}ms: {message}",
                    migration.migration_id
                );
                bookkeeping?;
                Ok(ExecutedMigration {
                    migration_id: migration.migration_id.clone(),
                    status: ExecutionStatus::Failed,
                    duration_ms,
                    error: Some(message),
                })
            }
        }
    }

    /// Rolls one applied migration back. Precondition violations (ill-formed
    /// or unknown migration id, no down script, not applied here) return
    /// failure results.
    pub fn rollback_migration(
        &self,
        database_id: &str,
        migration_id: &str,
        options: &RollbackOptions,
    ) -> Result<RollbackResult, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span =
            crate::metrics::tracing_helpers::rollback_migration_span(migration_id).entered();

        let start = Instant::now();
        let guard = LockGuard::acquire(
            &self.executor,
            database_id,
            &options.executed_by,
            self.options.lock_timeout_minutes,
        )?;
        let outcome = self.rollback_inner(database_id, migration_id, options, start);
        if let Err(e) = guard.release() {
            log::warn!("Failed to release migration lock on '{database_id}': {e}");
        }
        outcome
    }

    fn rollback_inner(
        &self,
        database_id: &str,
        migration_id: &str,
        options: &RollbackOptions,
        start: Instant,
    ) -> Result<RollbackResult, MigrationError> {
        let fail = |error: String| {
            log::warn!("Rollback of '{migration_id}' refused: {error}");
            RollbackResult {
                success: false,
                migration_id: migration_id.to_string(),
                duration_ms: start.elapsed().as_millis() as i64,
                error: Some(error),
            }
        };

        if let Err(e) = ids::validate_migration_id(migration_id) {
            return Ok(fail(e.to_string()));
        }
        let Some(migration) = registry::get_migration(&self.executor, database_id, migration_id)?
        else {
            return Ok(fail(format!(
                "migration '{migration_id}' is not registered for database '{database_id}'"
            )));
        };
        let Some(down_script) = migration.down_script.clone() else {
            return Ok(fail(format!(
                "migration '{migration_id}' is not reversible: it has no down script"
            )));
        };
        if !registry::is_applied(&self.executor, migration_id, database_id, options.environment)? {
            return Ok(fail(format!(
                "migration '{migration_id}' is not applied in the {} environment",
                options.environment
            )));
        }

        record_event(
            &self.executor,
            migration_id,
            database_id,
            EventType::Started,
            options.environment,
            options.context.as_ref(),
        );
        let execution_id = Uuid::new_v4();
        self.insert_execution(
            execution_id,
            migration_id,
            database_id,
            options.environment,
            &options.executed_by,
            options.context.as_ref(),
            ExecutionMode::Rollback,
        )?;

        let script_start = Instant::now();
        match self.execute_script(&down_script) {
            Ok(()) => {
                let duration_ms = script_start.elapsed().as_millis() as i64;
                let bookkeeping = self
                    .complete_execution(execution_id, ExecutionStatus::Success, duration_ms, None)
                    .and_then(|()| {
                        self.update_applied_status(
                            &migration,
                            options.environment,
                            &options.executed_by,
                            execution_id,
                            false,
                        )
                    });
                record_event(
                    &self.executor,
                    migration_id,
                    database_id,
                    EventType::RolledBack,
                    options.environment,
                    options.context.as_ref(),
                );
                log::info!("Rolled back '{migration_id}' in {duration_ms}ms");
                bookkeeping?;
                Ok(RollbackResult {
                    success: true,
                    migration_id: migration_id.to_string(),
                    duration_ms: start.elapsed().as_millis() as i64,
                    error: None,
                })
            }
            Err(e) => {
                let duration_ms = script_start.elapsed().as_millis() as i64;
                let message = e.to_string();
                let bookkeeping = self.complete_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    duration_ms,
                    Some(&message),
                );
                record_event(
                    &self.executor,
                    migration_id,
                    database_id,
                    EventType::Failed,
                    options.environment,
                    Some(&failure_context(&message, options.context.as_ref())),
                );
                #[cfg(feature = "metrics")]
                METRICS.record_migration_failed();
                log::error!("Rollback of '{migration_id}' failed: {message}");
                bookkeeping?;
                Ok(fail(message))
            }
        }
    }

    /// Read-only status aggregation; see `status::get_migration_status`.
    pub fn status(
        &self,
        database_id: Option<&str>,
        environment: Option<Environment>,
    ) -> Result<Vec<DatabaseStatus>, MigrationError> {
        status::get_migration_status(&self.executor, database_id, environment)
    }

    /// Captures a schema snapshot; see `snapshot::capture_schema_snapshot`.
    pub fn capture_snapshot(
        &self,
        database_id: &str,
        environment: Environment,
        capture_type: CaptureType,
        triggering_migration_id: Option<&str>,
        captured_by: &str,
    ) -> Result<SnapshotResult, MigrationError> {
        snapshot::capture_schema_snapshot(
            &self.executor,
            database_id,
            environment,
            capture_type,
            triggering_migration_id,
            captured_by,
            self.options.replicator.as_ref(),
        )
    }

    /// Runs the integrity checks; see `verify::verify_integrity`.
    pub fn verify(
        &self,
        database_id: &str,
        environment: Environment,
        fix_drift: bool,
    ) -> Result<IntegrityReport, MigrationError> {
        verify::verify_integrity(&self.executor, database_id, environment, fix_drift)
    }

    /// One transaction per script. The statement timeout dies with the
    /// transaction, so a stuck script cannot outlive the lock expiry.
    fn execute_script(&self, script: &str) -> Result<(), crate::TideError> {
        let txn = self
            .executor
            .begin_with_timeout(self.options.statement_timeout_seconds)?;
        if let Err(e) = txn.batch_execute(script) {
            if let Err(rollback_err) = txn.rollback() {
                log::warn!("Rollback after failed script also failed: {rollback_err}");
            }
            return Err(e);
        }
        txn.commit()?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_execution(
        &self,
        execution_id: Uuid,
        migration_id: &str,
        database_id: &str,
        environment: Environment,
        executed_by: &str,
        context: Option<&Value>,
        mode: ExecutionMode,
    ) -> Result<(), MigrationError> {
        let env = environment.as_str();
        self.executor.execute(
            "INSERT INTO tidemark_executions \
             (id, migration_id, database_id, environment, status, executor, \
              mode, context, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())",
            &[
                &execution_id,
                &migration_id,
                &database_id,
                &env,
                &ExecutionStatus::Running.as_str(),
                &executed_by,
                &mode.as_str(),
                &context,
            ],
        )?;
        Ok(())
    }

    fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<(), MigrationError> {
        self.executor.execute(
            "UPDATE tidemark_executions \
             SET status = $2, completed_at = NOW(), duration_ms = $3, error_message = $4 \
             WHERE id = $1",
            &[&execution_id, &status.as_str(), &duration_ms, &error],
        )?;
        Ok(())
    }

    fn update_applied_status(
        &self,
        migration: &Migration,
        environment: Environment,
        executed_by: &str,
        execution_id: Uuid,
        is_applied: bool,
    ) -> Result<(), MigrationError> {
        let env = environment.as_str();
        let applied_at = if is_applied { Some(Utc::now()) } else { None };
        self.executor.execute(
            "INSERT INTO tidemark_applied_status \
             (migration_id, database_id, environment, is_applied, applied_at, \
              applied_by, last_execution_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (migration_id, database_id, environment) DO UPDATE \
             SET is_applied = EXCLUDED.is_applied, \
                 applied_at = EXCLUDED.applied_at, \
                 applied_by = EXCLUDED.applied_by, \
                 last_execution_id = EXCLUDED.last_execution_id",
            &[
                &migration.migration_id,
                &migration.database_id,
                &env,
                &is_applied,
                &applied_at,
                &executed_by,
                &execution_id,
            ],
        )?;
        Ok(())
    }
}

fn failure_context(error: &str, context: Option<&Value>) -> Value {
    match context {
        Some(ctx) => serde_json::json!({ "error": error, "execution_context": ctx }),
        None => serde_json::json!({ "error": error }),
    }
}
