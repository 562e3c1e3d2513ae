//! Per-database, time-boxed migration lock.
//!
//! The lock is advisory mutual exclusion, not consensus: a row in
//! `tidemark_locks` with an expiry. Readers treat expired rows as absent, so
//! a crashed holder starves nobody past `expires_at`.

use super::error::MigrationError;
use super::types::MigrationLock;
use crate::TideExecutor;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

// The conditional upsert is the atomicity point: the primary key arbitrates
// concurrent inserts, and the WHERE clause refuses to steal an unexpired
// lock from a different holder. rows_affected == 0 means contention.
const ACQUIRE_SQL: &str = "\
INSERT INTO tidemark_locks (database_id, locked_by, locked_at, expires_at) \
VALUES ($1, $2, NOW(), NOW() + make_interval(mins => $3)) \
ON CONFLICT (database_id) DO UPDATE \
SET locked_by = EXCLUDED.locked_by, \
    locked_at = EXCLUDED.locked_at, \
    expires_at = EXCLUDED.expires_at \
WHERE tidemark_locks.locked_by = EXCLUDED.locked_by \
   OR tidemark_locks.expires_at < NOW()";

/// Tries to take the lock for `database_id`. Returns `false` without side
/// effects when another holder owns an unexpired lock. Re-acquiring a lock
/// you already hold refreshes its expiry.
pub fn try_acquire_lock(
    executor: &dyn TideExecutor,
    database_id: &str,
    owner: &str,
    timeout_minutes: i64,
) -> Result<bool, MigrationError> {
    let minutes = i32::try_from(timeout_minutes).unwrap_or(i32::MAX);
    let rows = executor.execute(ACQUIRE_SQL, &[&database_id, &owner, &minutes])?;
    if rows > 0 {
        #[cfg(feature = "metrics")]
        METRICS.record_lock_acquired();
        log::debug!("Acquired migration lock on '{database_id}' for '{owner}' ({timeout_minutes}m)");
        Ok(true)
    } else {
        #[cfg(feature = "metrics")]
        METRICS.record_lock_contention();
        Ok(false)
    }
}

/// Releases the lock if still owned by `owner`. Idempotent; releasing a lock
/// that is already gone (or was taken over after expiry) is not an error.
pub fn release_lock(
    executor: &dyn TideExecutor,
    database_id: &str,
    owner: &str,
) -> Result<(), MigrationError> {
    executor.execute(
        "DELETE FROM tidemark_locks WHERE database_id = $1 AND locked_by = $2",
        &[&database_id, &owner],
    )?;
    Ok(())
}

/// Current lock row for a database, expired or not.
pub fn get_lock(
    executor: &dyn TideExecutor,
    database_id: &str,
) -> Result<Option<MigrationLock>, MigrationError> {
    let rows = executor.query_all(
        "SELECT database_id, locked_by, locked_at, expires_at \
         FROM tidemark_locks WHERE database_id = $1",
        &[&database_id],
    )?;
    Ok(rows.first().map(MigrationLock::from_row))
}

/// Deletes the lock row for `database_id` if it has expired. Returns whether
/// a row was removed.
pub fn clear_expired_lock(
    executor: &dyn TideExecutor,
    database_id: &str,
) -> Result<bool, MigrationError> {
    let rows = executor.execute(
        "DELETE FROM tidemark_locks WHERE database_id = $1 AND expires_at < NOW()",
        &[&database_id],
    )?;
    Ok(rows > 0)
}

/// Holds the migration lock for the duration of a run and releases it on
/// drop, so an early return or panic cannot leave the database locked until
/// expiry.
pub struct LockGuard<'a> {
    executor: &'a dyn TideExecutor,
    database_id: String,
    owner: String,
    released: bool,
}

impl<'a> LockGuard<'a> {
    /// Acquires the lock or fails with `LockContention` naming the current
    /// holder. Never waits.
    pub fn acquire(
        executor: &'a dyn TideExecutor,
        database_id: &str,
        owner: &str,
        timeout_minutes: i64,
    ) -> Result<Self, MigrationError> {
        if try_acquire_lock(executor, database_id, owner, timeout_minutes)? {
            Ok(Self {
                executor,
                database_id: database_id.to_string(),
                owner: owner.to_string(),
                released: false,
            })
        } else {
            let held_by = get_lock(executor, database_id)?
                .map(|lock| lock.locked_by)
                .unwrap_or_else(|| "unknown".to_string());
            Err(MigrationError::LockContention {
                database_id: database_id.to_string(),
                held_by,
            })
        }
    }

    /// Explicit release, for callers that want the error rather than the
    /// warn-and-swallow of the drop path.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.released = true;
        release_lock(self.executor, &self.database_id, &self.owner)
    }
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = release_lock(self.executor, &self.database_id, &self.owner) {
                log::warn!(
                    "Failed to release migration lock on '{}': {e}",
                    self.database_id
                );
            }
        }
    }
}
