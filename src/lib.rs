//! # Tidemark
//!
//! Schema version control for PostgreSQL on the `may` coroutine runtime:
//! a registry-backed migration ledger with per-database locking, execution
//! history, schema snapshots, and an optional document mirror.
//!
//! See [README on GitHub](https://github.com/microscaler/tidemark) for full architecture.

pub mod config;
pub mod connection;
pub mod executor;
#[cfg(any(feature = "metrics", feature = "tracing"))]
pub mod metrics;
pub mod migration;
pub mod store;
pub mod transaction;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::TidemarkConfig;
pub use connection::{connect, ConnectionError};
pub use executor::{MayPostgresExecutor, TideError, TideExecutor};
pub use migration::{MigrationError, Migrator, MigratorOptions};
pub use transaction::{IsolationLevel, Transaction, TransactionError};
