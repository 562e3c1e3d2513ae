//! Shared helpers for integration tests.

use std::time::Duration;

use crate::connection::ConnectionError;
use crate::{MayPostgresExecutor, TideError, TideExecutor};

/// Connects with retries while the server finishes starting. Containers
/// accept TCP before they accept logins, so a few refusals are expected.
pub fn connect_with_retries(
    url: &str,
    attempts: u32,
) -> Result<MayPostgresExecutor, ConnectionError> {
    for _ in 1..attempts {
        if let Ok(client) = crate::connect(url) {
            return Ok(MayPostgresExecutor::new(client));
        }
        std::thread::sleep(Duration::from_millis(500));
    }
    Ok(MayPostgresExecutor::new(crate::connect(url)?))
}

/// Deletes every ledger row so a test starts from a clean slate.
///
/// # Errors
///
/// Returns `TideError` if a delete fails (usually the ledger tables do
/// not exist yet).
pub fn reset_ledger(executor: &dyn TideExecutor) -> Result<(), TideError> {
    for table in [
        "tidemark_events",
        "tidemark_snapshots",
        "tidemark_locks",
        "tidemark_executions",
        "tidemark_applied_status",
        "tidemark_migrations",
    ] {
        executor.execute(&format!("DELETE FROM {table}"), &[])?;
    }
    Ok(())
}

/// Drops every non-ledger table in the public schema, undoing whatever
/// the migration scripts under test created.
///
/// # Errors
///
/// Returns `TideError` if the catalog query or a drop fails.
pub fn drop_scratch_tables(executor: &dyn TideExecutor) -> Result<(), TideError> {
    let rows = executor.query_all(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' \
           AND table_type = 'BASE TABLE' \
           AND table_name NOT LIKE 'tidemark\\_%'",
        &[],
    )?;
    for row in rows {
        let name: String = row.get(0);
        executor.execute(&format!("DROP TABLE IF EXISTS {name} CASCADE"), &[])?;
    }
    Ok(())
}
