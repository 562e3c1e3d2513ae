//! Schema snapshots: point-in-time structural captures for drift detection.
//!
//! Introspection covers the `public` schema minus the engine's own
//! `tidemark_%` tables. Every list is deterministically ordered before
//! hashing, so the same live schema always produces the same hash.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::checksum::calculate_checksum;
use super::error::MigrationError;
use super::types::{CaptureType, Environment};
use crate::store::{ReplicationJob, Replicator};
use crate::TideExecutor;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub default: Option<String>,
    pub is_identity: bool,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub table: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineDefinition {
    pub name: String,
    pub kind: String,
    pub language: String,
}

/// Full structural definition of a database schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub tables: Vec<TableDefinition>,
    pub views: Vec<ViewDefinition>,
    pub indexes: Vec<IndexDefinition>,
    pub routines: Vec<RoutineDefinition>,
}

impl SchemaDefinition {
    /// SHA-256 over the serialized definition. Field order is fixed by the
    /// struct and all lists are sorted at introspection time, so the hash is
    /// stable across captures of an unchanged schema.
    pub fn hash(&self) -> Result<String, MigrationError> {
        let serialized = serde_json::to_string(self)?;
        Ok(calculate_checksum(&serialized))
    }
}

/// Outcome of a capture.
#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub snapshot_id: Uuid,
    pub schema_hash: String,
    pub table_count: usize,
    pub backup_document_id: Option<String>,
}

fn yes(value: &str) -> bool {
    value == "YES"
}

/// Reads the live schema into a deterministic `SchemaDefinition`.
pub fn introspect_schema(
    executor: &dyn TideExecutor,
) -> Result<SchemaDefinition, MigrationError> {
    let table_rows = executor.query_all(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
           AND table_name NOT LIKE 'tidemark\\_%' \
         ORDER BY table_name",
        &[],
    )?;
    let mut tables: Vec<TableDefinition> = table_rows
        .iter()
        .map(|row| TableDefinition {
            name: row.get(0),
            columns: Vec::new(),
        })
        .collect();
    let index_of: HashMap<String, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i))
        .collect();

    let pk_rows = executor.query_all(
        "SELECT tc.table_name, kcu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON kcu.constraint_name = tc.constraint_name \
          AND kcu.table_schema = tc.table_schema \
         WHERE tc.table_schema = 'public' AND tc.constraint_type = 'PRIMARY KEY'",
        &[],
    )?;
    let primary_keys: HashSet<(String, String)> = pk_rows
        .iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect();

    let column_rows = executor.query_all(
        "SELECT table_name, column_name, data_type, is_nullable, \
         column_default, is_identity \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name NOT LIKE 'tidemark\\_%' \
         ORDER BY table_name, ordinal_position",
        &[],
    )?;
    for row in &column_rows {
        let table: String = row.get(0);
        let Some(&i) = index_of.get(&table) else {
            continue;
        };
        let name: String = row.get(1);
        let is_nullable: String = row.get(3);
        let is_identity: String = row.get(5);
        let is_primary_key = primary_keys.contains(&(table, name.clone()));
        tables[i].columns.push(ColumnDefinition {
            name,
            data_type: row.get(2),
            is_nullable: yes(&is_nullable),
            default: row.get(4),
            is_identity: yes(&is_identity),
            is_primary_key,
        });
    }

    let view_rows = executor.query_all(
        "SELECT table_name, COALESCE(view_definition, '') \
         FROM information_schema.views \
         WHERE table_schema = 'public' ORDER BY table_name",
        &[],
    )?;
    let views = view_rows
        .iter()
        .map(|row| ViewDefinition {
            name: row.get(0),
            definition: row.get(1),
        })
        .collect();

    let index_rows = executor.query_all(
        "SELECT indexname, tablename, indexdef FROM pg_indexes \
         WHERE schemaname = 'public' AND tablename NOT LIKE 'tidemark\\_%' \
         ORDER BY indexname",
        &[],
    )?;
    let indexes = index_rows
        .iter()
        .map(|row| IndexDefinition {
            name: row.get(0),
            table: row.get(1),
            definition: row.get(2),
        })
        .collect();

    let routine_rows = executor.query_all(
        "SELECT routine_name, COALESCE(routine_type, ''), \
         COALESCE(external_language, '') \
         FROM information_schema.routines \
         WHERE routine_schema = 'public' \
         ORDER BY routine_name, specific_name",
        &[],
    )?;
    let routines = routine_rows
        .iter()
        .map(|row| RoutineDefinition {
            name: row.get(0),
            kind: row.get(1),
            language: row.get(2),
        })
        .collect();

    Ok(SchemaDefinition {
        tables,
        views,
        indexes,
        routines,
    })
}

/// Captures the live schema: hashes it, writes the lightweight index row to
/// the ledger and hands the full definition to the mirror. The ledger write
/// is authoritative; the mirror document may lag.
pub fn capture_schema_snapshot(
    executor: &dyn TideExecutor,
    database_id: &str,
    environment: Environment,
    capture_type: CaptureType,
    triggering_migration_id: Option<&str>,
    captured_by: &str,
    replicator: Option<&Replicator>,
) -> Result<SnapshotResult, MigrationError> {
    #[cfg(feature = "tracing")]
    let _span = crate::metrics::tracing_helpers::capture_snapshot_span(database_id).entered();

    let definition = introspect_schema(executor)?;
    let schema_hash = definition.hash()?;
    let snapshot_id = Uuid::new_v4();
    let captured_at = Utc::now();
    let backup_document_id =
        replicator.map(|_| format!("snapshot::{snapshot_id}"));

    let env = environment.as_str();
    let table_count = i32::try_from(definition.tables.len()).unwrap_or(i32::MAX);
    let view_count = i32::try_from(definition.views.len()).unwrap_or(i32::MAX);
    let index_count = i32::try_from(definition.indexes.len()).unwrap_or(i32::MAX);
    let routine_count = i32::try_from(definition.routines.len()).unwrap_or(i32::MAX);
    executor.execute(
        "INSERT INTO tidemark_snapshots \
         (snapshot_id, database_id, environment, captured_at, schema_hash, \
          table_count, view_count, index_count, routine_count, \
          triggering_migration_id, capture_type, captured_by, backup_document_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        &[
            &snapshot_id,
            &database_id,
            &env,
            &captured_at,
            &schema_hash,
            &table_count,
            &view_count,
            &index_count,
            &routine_count,
            &triggering_migration_id,
            &capture_type.as_str(),
            &captured_by,
            &backup_document_id,
        ],
    )?;

    if let Some(replicator) = replicator {
        let document = serde_json::json!({
            "snapshot_id": snapshot_id,
            "database_id": database_id,
            "environment": env,
            "captured_at": captured_at,
            "schema_hash": schema_hash,
            "capture_type": capture_type.as_str(),
            "captured_by": captured_by,
            "triggering_migration_id": triggering_migration_id,
            "schema": definition,
        });
        replicator.enqueue(ReplicationJob::snapshot(
            database_id,
            &snapshot_id.to_string(),
            document,
        ));
    }

    #[cfg(feature = "metrics")]
    METRICS.record_snapshot_captured();
    log::info!(
        "Captured {} schema snapshot {snapshot_id} for '{database_id}' ({env}): \
         {} tables, hash {schema_hash}",
        capture_type.as_str(),
        definition.tables.len()
    );

    Ok(SnapshotResult {
        snapshot_id,
        schema_hash,
        table_count: definition.tables.len(),
        backup_document_id,
    })
}

/// Id, hash and capture time of the most recent snapshot for
/// `(database_id, environment)`.
pub fn latest_snapshot_hash(
    executor: &dyn TideExecutor,
    database_id: &str,
    environment: Environment,
) -> Result<Option<(Uuid, String, chrono::DateTime<Utc>)>, MigrationError> {
    let env = environment.as_str();
    let rows = executor.query_all(
        "SELECT snapshot_id, schema_hash, captured_at FROM tidemark_snapshots \
         WHERE database_id = $1 AND environment = $2 \
         ORDER BY captured_at DESC LIMIT 1",
        &[&database_id, &env],
    )?;
    Ok(rows
        .first()
        .map(|row| (row.get(0), row.get(1), row.get(2))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> SchemaDefinition {
        SchemaDefinition {
            tables: vec![TableDefinition {
                name: "users".to_string(),
                columns: vec![ColumnDefinition {
                    name: "id".to_string(),
                    data_type: "bigint".to_string(),
                    is_nullable: false,
                    default: None,
                    is_identity: true,
                    is_primary_key: true,
                }],
            }],
            views: vec![],
            indexes: vec![IndexDefinition {
                name: "users_pkey".to_string(),
                table: "users".to_string(),
                definition: "CREATE UNIQUE INDEX users_pkey ON users (id)".to_string(),
            }],
            routines: vec![],
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = definition();
        let b = definition();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn test_hash_changes_with_structure() {
        let a = definition();
        let mut b = definition();
        b.tables[0].columns[0].data_type = "integer".to_string();
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn test_hash_changes_when_column_added() {
        let a = definition();
        let mut b = definition();
        b.tables[0].columns.push(ColumnDefinition {
            name: "email".to_string(),
            data_type: "text".to_string(),
            is_nullable: true,
            default: None,
            is_identity: false,
            is_primary_key: false,
        });
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }
}
