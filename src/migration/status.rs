//! Read-only status aggregation over the ledger. Never mutates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::error::MigrationError;
use super::registry;
use super::types::{AppliedStatus, Environment, Migration};
use crate::TideExecutor;

/// Applied-or-pending state of one migration in one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Applied,
    Pending,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Applied => "applied",
            MigrationState::Pending => "pending",
        }
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the per-migration matrix: the same migration's state in both
/// physical environments.
#[derive(Debug, Clone)]
pub struct MigrationStatusRow {
    pub migration_id: String,
    pub description: String,
    pub dev: MigrationState,
    pub prod: MigrationState,
}

/// Aggregate status for one database. Counts are relative to the requested
/// environment; the matrix always carries both.
#[derive(Debug, Clone)]
pub struct DatabaseStatus {
    pub database_id: String,
    pub total_migrations: usize,
    pub applied_migrations: usize,
    pub pending_migrations: usize,
    pub last_migration_at: Option<DateTime<Utc>>,
    pub migrations: Vec<MigrationStatusRow>,
}

impl DatabaseStatus {
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_migrations == 0
    }
}

/// Status across databases. `database_id = None` reports every database with
/// at least one registered migration; `environment = None` counts against
/// `dev`.
pub fn get_migration_status(
    executor: &dyn TideExecutor,
    database_id: Option<&str>,
    environment: Option<Environment>,
) -> Result<Vec<DatabaseStatus>, MigrationError> {
    let environment = environment.unwrap_or(Environment::Dev);
    let database_ids = match database_id {
        Some(db) => vec![db.to_string()],
        None => registry::list_database_ids(executor)?,
    };

    let mut databases = Vec::with_capacity(database_ids.len());
    for db in database_ids {
        let migrations = registry::list_migrations(executor, &db)?;
        let statuses = load_applied_statuses(executor, &db)?;
        databases.push(assemble_database_status(
            &db,
            &migrations,
            &statuses,
            environment,
        ));
    }
    Ok(databases)
}

fn load_applied_statuses(
    executor: &dyn TideExecutor,
    database_id: &str,
) -> Result<Vec<AppliedStatus>, MigrationError> {
    let rows = executor.query_all(
        "SELECT migration_id, database_id, environment, is_applied, \
         applied_at, applied_by, last_execution_id \
         FROM tidemark_applied_status WHERE database_id = $1",
        &[&database_id],
    )?;
    rows.iter().map(AppliedStatus::from_row).collect()
}

fn assemble_database_status(
    database_id: &str,
    migrations: &[Migration],
    statuses: &[AppliedStatus],
    environment: Environment,
) -> DatabaseStatus {
    let mut applied_in: HashMap<(&str, Environment), &AppliedStatus> = HashMap::new();
    for status in statuses {
        applied_in.insert((status.migration_id.as_str(), status.environment), status);
    }

    let state = |migration_id: &str, env: Environment| -> MigrationState {
        match applied_in.get(&(migration_id, env)) {
            Some(status) if status.is_applied => MigrationState::Applied,
            _ => MigrationState::Pending,
        }
    };

    let rows: Vec<MigrationStatusRow> = migrations
        .iter()
        .map(|m| MigrationStatusRow {
            migration_id: m.migration_id.clone(),
            description: m.description.clone(),
            dev: state(&m.migration_id, Environment::Dev),
            prod: state(&m.migration_id, Environment::Prod),
        })
        .collect();

    let applied_migrations = migrations
        .iter()
        .filter(|m| state(&m.migration_id, environment) == MigrationState::Applied)
        .count();
    let last_migration_at = statuses
        .iter()
        .filter(|s| s.environment == environment && s.is_applied)
        .filter_map(|s| s.applied_at)
        .max();

    DatabaseStatus {
        database_id: database_id.to_string(),
        total_migrations: migrations.len(),
        applied_migrations,
        pending_migrations: migrations.len() - applied_migrations,
        last_migration_at,
        migrations: rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn migration(id: &str) -> Migration {
        Migration {
            database_id: "core".to_string(),
            migration_id: id.to_string(),
            description: format!("migration {id}"),
            up_script: "SELECT 1".to_string(),
            down_script: None,
            checksum: "0".repeat(64),
            author: "alice".to_string(),
            created_at: Utc::now(),
            is_reversible: false,
            depends_on: vec![],
            tags: vec![],
        }
    }

    fn applied(id: &str, environment: Environment, at: DateTime<Utc>) -> AppliedStatus {
        AppliedStatus {
            migration_id: id.to_string(),
            database_id: "core".to_string(),
            environment,
            is_applied: true,
            applied_at: Some(at),
            applied_by: "alice".to_string(),
            last_execution_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_matrix_tracks_environments_independently() {
        let migrations = vec![
            migration("20250101_000000_first"),
            migration("20250102_000000_second"),
        ];
        let statuses = vec![
            applied("20250101_000000_first", Environment::Dev, Utc::now()),
            applied("20250101_000000_first", Environment::Prod, Utc::now()),
            applied("20250102_000000_second", Environment::Dev, Utc::now()),
        ];

        let status =
            assemble_database_status("core", &migrations, &statuses, Environment::Dev);
        assert_eq!(status.total_migrations, 2);
        assert_eq!(status.applied_migrations, 2);
        assert_eq!(status.pending_migrations, 0);
        assert!(status.is_up_to_date());

        let second = &status.migrations[1];
        assert_eq!(second.dev, MigrationState::Applied);
        assert_eq!(second.prod, MigrationState::Pending);
    }

    #[test]
    fn test_counts_follow_requested_environment() {
        let migrations = vec![
            migration("20250101_000000_first"),
            migration("20250102_000000_second"),
        ];
        let statuses = vec![applied(
            "20250101_000000_first",
            Environment::Dev,
            Utc::now(),
        )];

        let in_prod =
            assemble_database_status("core", &migrations, &statuses, Environment::Prod);
        assert_eq!(in_prod.applied_migrations, 0);
        assert_eq!(in_prod.pending_migrations, 2);
        assert!(in_prod.last_migration_at.is_none());
    }

    #[test]
    fn test_last_migration_at_is_latest_applied() {
        let migrations = vec![
            migration("20250101_000000_first"),
            migration("20250102_000000_second"),
        ];
        let earlier = Utc::now() - Duration::hours(2);
        let later = Utc::now();
        let statuses = vec![
            applied("20250101_000000_first", Environment::Dev, earlier),
            applied("20250102_000000_second", Environment::Dev, later),
        ];

        let status =
            assemble_database_status("core", &migrations, &statuses, Environment::Dev);
        assert_eq!(status.last_migration_at, Some(later));
    }

    #[test]
    fn test_unapplied_row_counts_as_pending() {
        let migrations = vec![migration("20250101_000000_first")];
        let mut rolled_back = applied("20250101_000000_first", Environment::Dev, Utc::now());
        rolled_back.is_applied = false;

        let status = assemble_database_status(
            "core",
            &migrations,
            &[rolled_back],
            Environment::Dev,
        );
        assert_eq!(status.applied_migrations, 0);
        assert_eq!(status.migrations[0].dev, MigrationState::Pending);
    }
}
