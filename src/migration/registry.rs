//! Migration registry: persistence of migration metadata in the ledger.
//!
//! Registration is the only write path for `tidemark_migrations`; rows are
//! immutable afterwards. The checksum is computed here, once, over the final
//! up script.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::checksum::calculate_checksum;
use super::error::MigrationError;
use super::file;
use super::ids::{generate_migration_id, validate_migration_id};
use super::types::{Environment, Migration};
use crate::store::{ReplicationJob, Replicator};
use crate::TideExecutor;

/// Input for registering a new migration. Only `name`, `database_id` and
/// `author` are required; everything else has a sensible default.
#[derive(Debug, Clone, Default)]
pub struct MigrationDraft {
    pub name: String,
    pub database_id: String,
    pub author: String,
    pub description: Option<String>,
    pub up_script: Option<String>,
    pub down_script: Option<String>,
    pub depends_on: Vec<String>,
    pub tags: Vec<String>,
}

impl MigrationDraft {
    pub fn new(name: &str, database_id: &str, author: &str) -> Self {
        Self {
            name: name.to_string(),
            database_id: database_id.to_string(),
            author: author.to_string(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_up_script(mut self, script: &str) -> Self {
        self.up_script = Some(script.to_string());
        self
    }

    pub fn with_down_script(mut self, script: &str) -> Self {
        self.down_script = Some(script.to_string());
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct CreatedMigration {
    pub migration_id: String,
    pub file_path: PathBuf,
    pub message: String,
}

/// Resolves a draft into the immutable migration row: validates required
/// fields, derives the id from `created_at`, fills in the boilerplate up
/// template when none was given and checksums the result.
pub fn build_migration(
    draft: MigrationDraft,
    created_at: DateTime<Utc>,
) -> Result<Migration, MigrationError> {
    if draft.database_id.trim().is_empty() {
        return Err(MigrationError::Validation(
            "database id is required".to_string(),
        ));
    }
    if draft.author.trim().is_empty() {
        return Err(MigrationError::Validation("author is required".to_string()));
    }
    for dependency in &draft.depends_on {
        validate_migration_id(dependency)?;
    }

    let migration_id = generate_migration_id(&draft.name, created_at)?;
    let description = draft.description.unwrap_or_else(|| draft.name.clone());
    let up_script = draft
        .up_script
        .unwrap_or_else(|| file::default_up_template(&description));
    let checksum = calculate_checksum(&up_script);
    let is_reversible = draft.down_script.is_some();

    Ok(Migration {
        database_id: draft.database_id,
        migration_id,
        description,
        up_script,
        down_script: draft.down_script,
        checksum,
        author: draft.author,
        created_at,
        is_reversible,
        depends_on: draft.depends_on,
        tags: draft.tags,
    })
}

/// Registers a new migration: one authoritative ledger row, a best-effort
/// mirror document, and a best-effort script file. Only the ledger write can
/// fail the call.
pub fn create_migration(
    executor: &dyn TideExecutor,
    draft: MigrationDraft,
    migrations_dir: &Path,
    replicator: Option<&Replicator>,
) -> Result<CreatedMigration, MigrationError> {
    let migration = build_migration(draft, Utc::now())?;
    insert_migration(executor, &migration)?;
    log::info!(
        "Registered migration '{}' for database '{}'",
        migration.migration_id,
        migration.database_id
    );

    if let Some(replicator) = replicator {
        let document = serde_json::to_value(&migration)?;
        replicator.enqueue(ReplicationJob::migration(
            &migration.database_id,
            &migration.migration_id,
            document,
        ));
    }

    let file_path = file::migration_file_path(
        migrations_dir,
        &migration.database_id,
        &migration.migration_id,
    );
    let message = match file::write_migration_file(migrations_dir, &migration) {
        Ok(path) => format!(
            "Registered migration '{}'; script written to {}",
            migration.migration_id,
            path.display()
        ),
        Err(e) => {
            log::warn!(
                "Migration '{}' registered but its script file was not written: {e}",
                migration.migration_id
            );
            format!(
                "Registered migration '{}'; script file could not be written: {e}",
                migration.migration_id
            )
        }
    };

    Ok(CreatedMigration {
        migration_id: migration.migration_id,
        file_path,
        message,
    })
}

fn insert_migration(
    executor: &dyn TideExecutor,
    migration: &Migration,
) -> Result<(), MigrationError> {
    // DO NOTHING instead of an error trap: rows_affected == 0 is the
    // conflict signal, with no error-string matching.
    let rows = executor.execute(
        "INSERT INTO tidemark_migrations \
         (database_id, migration_id, description, up_script, down_script, \
          checksum, author, created_at, is_reversible, depends_on, tags) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (database_id, migration_id) DO NOTHING",
        &[
            &migration.database_id,
            &migration.migration_id,
            &migration.description,
            &migration.up_script,
            &migration.down_script,
            &migration.checksum,
            &migration.author,
            &migration.created_at,
            &migration.is_reversible,
            &migration.depends_on,
            &migration.tags,
        ],
    )?;
    if rows == 0 {
        return Err(MigrationError::Registration(format!(
            "migration '{}' already exists for database '{}'",
            migration.migration_id, migration.database_id
        )));
    }
    Ok(())
}

const SELECT_MIGRATION: &str = "SELECT m.database_id, m.migration_id, m.description, \
     m.up_script, m.down_script, m.checksum, m.author, m.created_at, \
     m.is_reversible, m.depends_on, m.tags FROM tidemark_migrations m";

/// Looks up one registered migration.
pub fn get_migration(
    executor: &dyn TideExecutor,
    database_id: &str,
    migration_id: &str,
) -> Result<Option<Migration>, MigrationError> {
    let query = format!("{SELECT_MIGRATION} WHERE m.database_id = $1 AND m.migration_id = $2");
    let rows = executor.query_all(&query, &[&database_id, &migration_id])?;
    Ok(rows.first().map(Migration::from_row))
}

/// All migrations for a database, ascending id order (creation order).
pub fn list_migrations(
    executor: &dyn TideExecutor,
    database_id: &str,
) -> Result<Vec<Migration>, MigrationError> {
    let query = format!("{SELECT_MIGRATION} WHERE m.database_id = $1 ORDER BY m.migration_id ASC");
    let rows = executor.query_all(&query, &[&database_id])?;
    Ok(rows.iter().map(Migration::from_row).collect())
}

/// Every database id that has at least one registered migration.
pub fn list_database_ids(executor: &dyn TideExecutor) -> Result<Vec<String>, MigrationError> {
    let rows = executor.query_all(
        "SELECT DISTINCT database_id FROM tidemark_migrations ORDER BY database_id",
        &[],
    )?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Migrations with no applied-status row (or `is_applied = false`) for the
/// environment, ascending id order.
pub fn load_pending(
    executor: &dyn TideExecutor,
    database_id: &str,
    environment: Environment,
) -> Result<Vec<Migration>, MigrationError> {
    let env = environment.as_str();
    let query = format!(
        "{SELECT_MIGRATION} \
         LEFT JOIN tidemark_applied_status s \
           ON s.migration_id = m.migration_id \
          AND s.database_id = m.database_id \
          AND s.environment = $2 \
         WHERE m.database_id = $1 \
           AND (s.is_applied IS NULL OR s.is_applied = FALSE) \
         ORDER BY m.migration_id ASC"
    );
    let rows = executor.query_all(&query, &[&database_id, &env])?;
    Ok(rows.iter().map(Migration::from_row).collect())
}

/// Ids applied in the environment, for dependency checks.
pub fn applied_migration_ids(
    executor: &dyn TideExecutor,
    database_id: &str,
    environment: Environment,
) -> Result<BTreeSet<String>, MigrationError> {
    let env = environment.as_str();
    let rows = executor.query_all(
        "SELECT migration_id FROM tidemark_applied_status \
         WHERE database_id = $1 AND environment = $2 AND is_applied = TRUE",
        &[&database_id, &env],
    )?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Whether one specific migration is applied in the environment.
pub fn is_applied(
    executor: &dyn TideExecutor,
    migration_id: &str,
    database_id: &str,
    environment: Environment,
) -> Result<bool, MigrationError> {
    let env = environment.as_str();
    let rows = executor.query_all(
        "SELECT is_applied FROM tidemark_applied_status \
         WHERE migration_id = $1 AND database_id = $2 AND environment = $3",
        &[&migration_id, &database_id, &env],
    )?;
    Ok(rows.first().map(|row| row.get(0)).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::checksum::verify_checksum;
    use chrono::TimeZone;

    fn draft() -> MigrationDraft {
        MigrationDraft::new("Add Users Table", "core", "alice")
    }

    #[test]
    fn test_build_migration_checksums_final_up_script() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 8, 30, 15).unwrap();
        let built = build_migration(
            draft().with_up_script("CREATE TABLE users (id BIGINT)"),
            at,
        )
        .unwrap();
        assert_eq!(built.migration_id, "20250101_083015_add_users_table");
        assert!(verify_checksum(&built.checksum, &built.up_script));
    }

    #[test]
    fn test_build_migration_defaults() {
        let built = build_migration(draft(), Utc::now()).unwrap();
        assert_eq!(built.description, "Add Users Table");
        assert!(built.up_script.contains("SELECT 1;"), "template up script");
        assert!(verify_checksum(&built.checksum, &built.up_script));
        assert!(!built.is_reversible);
        assert!(built.down_script.is_none());
    }

    #[test]
    fn test_build_migration_reversible_when_down_given() {
        let built = build_migration(
            draft().with_down_script("DROP TABLE users"),
            Utc::now(),
        )
        .unwrap();
        assert!(built.is_reversible);
    }

    #[test]
    fn test_build_migration_rejects_malformed_dependency() {
        let bad = draft().with_depends_on(vec!["init".to_string()]);
        assert!(matches!(
            build_migration(bad, Utc::now()),
            Err(MigrationError::InvalidId(_))
        ));
    }

    #[test]
    fn test_build_migration_requires_identity_fields() {
        let mut missing_db = draft();
        missing_db.database_id = "  ".to_string();
        assert!(matches!(
            build_migration(missing_db, Utc::now()),
            Err(MigrationError::Validation(_))
        ));

        let mut missing_author = draft();
        missing_author.author = String::new();
        assert!(matches!(
            build_migration(missing_author, Utc::now()),
            Err(MigrationError::Validation(_))
        ));
    }
}
