//! Ledger schema bootstrap.
//!
//! All engine state lives in `tidemark_`-prefixed tables created with
//! `IF NOT EXISTS` semantics, so `initialize_ledger` is idempotent and safe
//! to run before every operation.

use sea_query::{ColumnDef, ColumnType, Index, PostgresQueryBuilder, Table};

use super::error::MigrationError;
use crate::TideExecutor;

fn migrations_table() -> String {
    Table::create()
        .table("tidemark_migrations")
        .if_not_exists()
        .col(ColumnDef::new("database_id").text().not_null())
        .col(ColumnDef::new("migration_id").text().not_null())
        .col(ColumnDef::new("description").text().not_null())
        .col(ColumnDef::new("up_script").text().not_null())
        .col(ColumnDef::new("down_script").text().null())
        .col(ColumnDef::new("checksum").string_len(64).not_null())
        .col(ColumnDef::new("author").text().not_null())
        .col(
            ColumnDef::new("created_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(ColumnDef::new("is_reversible").boolean().not_null())
        .col(
            ColumnDef::new("depends_on")
                .array(ColumnType::Text)
                .not_null(),
        )
        .col(ColumnDef::new("tags").array(ColumnType::Text).not_null())
        .primary_key(Index::create().col("database_id").col("migration_id"))
        .to_owned()
        .build(PostgresQueryBuilder)
}

fn applied_status_table() -> String {
    Table::create()
        .table("tidemark_applied_status")
        .if_not_exists()
        .col(ColumnDef::new("migration_id").text().not_null())
        .col(ColumnDef::new("database_id").text().not_null())
        .col(ColumnDef::new("environment").text().not_null())
        .col(ColumnDef::new("is_applied").boolean().not_null())
        .col(
            ColumnDef::new("applied_at")
                .timestamp_with_time_zone()
                .null(),
        )
        .col(ColumnDef::new("applied_by").text().not_null())
        .col(ColumnDef::new("last_execution_id").uuid().not_null())
        .primary_key(
            Index::create()
                .col("migration_id")
                .col("database_id")
                .col("environment"),
        )
        .to_owned()
        .build(PostgresQueryBuilder)
}

fn executions_table() -> String {
    Table::create()
        .table("tidemark_executions")
        .if_not_exists()
        .col(ColumnDef::new("id").uuid().not_null().primary_key())
        .col(ColumnDef::new("migration_id").text().not_null())
        .col(ColumnDef::new("database_id").text().not_null())
        .col(ColumnDef::new("environment").text().not_null())
        .col(ColumnDef::new("status").text().not_null())
        .col(ColumnDef::new("executor").text().not_null())
        .col(ColumnDef::new("mode").text().not_null())
        .col(ColumnDef::new("context").json_binary().null())
        .col(
            ColumnDef::new("started_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new("completed_at")
                .timestamp_with_time_zone()
                .null(),
        )
        .col(ColumnDef::new("duration_ms").big_integer().null())
        .col(ColumnDef::new("error_message").text().null())
        .to_owned()
        .build(PostgresQueryBuilder)
}

fn locks_table() -> String {
    Table::create()
        .table("tidemark_locks")
        .if_not_exists()
        .col(ColumnDef::new("database_id").text().not_null().primary_key())
        .col(ColumnDef::new("locked_by").text().not_null())
        .col(
            ColumnDef::new("locked_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new("expires_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned()
        .build(PostgresQueryBuilder)
}

fn snapshots_table() -> String {
    Table::create()
        .table("tidemark_snapshots")
        .if_not_exists()
        .col(ColumnDef::new("snapshot_id").uuid().not_null().primary_key())
        .col(ColumnDef::new("database_id").text().not_null())
        .col(ColumnDef::new("environment").text().not_null())
        .col(
            ColumnDef::new("captured_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(ColumnDef::new("schema_hash").string_len(64).not_null())
        .col(ColumnDef::new("table_count").integer().not_null())
        .col(ColumnDef::new("view_count").integer().not_null())
        .col(ColumnDef::new("index_count").integer().not_null())
        .col(ColumnDef::new("routine_count").integer().not_null())
        .col(ColumnDef::new("triggering_migration_id").text().null())
        .col(ColumnDef::new("capture_type").text().not_null())
        .col(ColumnDef::new("captured_by").text().not_null())
        .col(ColumnDef::new("backup_document_id").text().null())
        .to_owned()
        .build(PostgresQueryBuilder)
}

fn events_table() -> String {
    Table::create()
        .table("tidemark_events")
        .if_not_exists()
        .col(
            ColumnDef::new("id")
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new("migration_id").text().not_null())
        .col(ColumnDef::new("database_id").text().not_null())
        .col(ColumnDef::new("event_type").text().not_null())
        .col(ColumnDef::new("environment").text().not_null())
        .col(ColumnDef::new("context").text().not_null())
        .col(
            ColumnDef::new("created_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned()
        .build(PostgresQueryBuilder)
}

fn ledger_indexes() -> Vec<String> {
    vec![
        Index::create()
            .if_not_exists()
            .name("idx_tidemark_executions_database_migration")
            .table("tidemark_executions")
            .col("database_id")
            .col("migration_id")
            .to_owned()
            .build(PostgresQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_tidemark_events_database_migration")
            .table("tidemark_events")
            .col("database_id")
            .col("migration_id")
            .to_owned()
            .build(PostgresQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_tidemark_snapshots_database_environment_captured")
            .table("tidemark_snapshots")
            .col("database_id")
            .col("environment")
            .col("captured_at")
            .to_owned()
            .build(PostgresQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_tidemark_applied_status_database_environment")
            .table("tidemark_applied_status")
            .col("database_id")
            .col("environment")
            .to_owned()
            .build(PostgresQueryBuilder),
    ]
}

/// All DDL statements for the ledger, tables before indexes.
pub fn ledger_ddl() -> Vec<String> {
    let mut statements = vec![
        migrations_table(),
        applied_status_table(),
        executions_table(),
        locks_table(),
        snapshots_table(),
        events_table(),
    ];
    statements.extend(ledger_indexes());
    statements
}

/// Creates every ledger table and index. Idempotent; run before any other
/// operation against a fresh database.
pub fn initialize_ledger(executor: &dyn TideExecutor) -> Result<(), MigrationError> {
    for statement in ledger_ddl() {
        executor.execute(&statement, &[])?;
    }
    log::debug!("Migration ledger schema is in place");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_covers_all_ledger_tables() {
        let ddl = ledger_ddl();
        assert_eq!(ddl.len(), 10, "six tables and four indexes");

        let all = ddl.join("\n");
        for table in [
            "tidemark_migrations",
            "tidemark_applied_status",
            "tidemark_executions",
            "tidemark_locks",
            "tidemark_snapshots",
            "tidemark_events",
        ] {
            assert!(all.contains(table), "missing DDL for {table}");
        }
    }

    #[test]
    fn test_ddl_is_idempotent() {
        for statement in ledger_ddl() {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement must be re-runnable: {statement}"
            );
        }
    }

    #[test]
    fn test_composite_primary_keys() {
        assert!(migrations_table().contains("PRIMARY KEY"));
        assert!(applied_status_table().contains("PRIMARY KEY"));
    }
}
