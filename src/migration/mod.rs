//! Schema version control for Tidemark
//!
//! This module provides the migration engine, including:
//! - Migration registration and id generation
//! - Lock-protected forward and rollback execution
//! - Status aggregation across environments
//! - Schema snapshots and integrity verification
//!
//! # Example
//!
//! ```rust,no_run
//! use tidemark::MayPostgresExecutor;
//! use tidemark::migration::{Environment, Migrator, MigratorOptions, RunOptions};
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = tidemark::connect("postgres://localhost:5432/app")?;
//!     let migrator = Migrator::new(
//!         MayPostgresExecutor::new(client),
//!         MigratorOptions::default(),
//!     );
//!     migrator.initialize_ledger()?;
//!
//!     let result = migrator.run_migrations(
//!         "billing",
//!         &RunOptions::new(Environment::Dev, "deploy-bot"),
//!     )?;
//!     for executed in &result.executed_migrations {
//!         println!("{}: {}", executed.migration_id, executed.status.as_str());
//!     }
//!     migrator.close();
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod events;
pub mod file;
pub mod ids;
pub mod lock;
pub mod migrator;
pub mod registry;
pub mod snapshot;
pub mod state_table;
pub mod status;
pub mod types;
pub mod verify;

pub use checksum::{calculate_checksum, verify_checksum};
pub use error::MigrationError;
pub use ids::generate_migration_id;
pub use migrator::{
    ExecutedMigration, MigrationRunResult, Migrator, MigratorOptions, RollbackOptions,
    RollbackResult, RunOptions, SkipReason, SkippedMigration,
};
pub use registry::{CreatedMigration, MigrationDraft};
pub use snapshot::{SchemaDefinition, SnapshotResult};
pub use status::{DatabaseStatus, MigrationState, MigrationStatusRow};
pub use types::{
    AppliedStatus, CaptureType, Environment, EventType, ExecutionMode, ExecutionStatus, Migration,
    MigrationLock,
};
pub use verify::{IntegrityIssue, IntegrityReport, IssueType, Severity};
