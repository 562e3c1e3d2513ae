//! Tidemark Migration CLI Tool
//!
//! Command-line interface for managing database migrations with Tidemark.
//! Supports both interactive use and integration with CI/CD pipelines.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process;

use tidemark::migration::{
    CaptureType, Environment, ExecutionStatus, MigrationDraft, MigrationError, MigrationState,
    Migrator, MigratorOptions, RollbackOptions, RunOptions, Severity,
};
use tidemark::store::{RedisStore, Replicator, ReplicatorOptions};
use tidemark::{connect, MayPostgresExecutor};

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Schema version control for PostgreSQL")]
#[command(version = "0.1.0")]
struct Cli {
    /// Database connection URL
    #[arg(long)]
    database_url: Option<String>,

    /// Migrations directory path
    #[arg(long, default_value = "migrations")]
    migrations_dir: PathBuf,

    /// Environment to operate on (dev or prod)
    #[arg(short, long, default_value = "dev")]
    environment: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ledger tables (idempotent)
    Init,

    /// Register a new migration
    Create {
        /// Migration name (e.g. "add users table")
        name: String,

        /// Database the migration belongs to
        #[arg(long)]
        database: String,

        /// Author recorded in the registry
        #[arg(long)]
        author: String,

        /// Description (defaults to the name)
        #[arg(long)]
        description: Option<String>,

        /// Migration id this one depends on (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Free-form tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Apply pending migrations
    Run {
        /// Database to migrate
        #[arg(long)]
        database: String,

        /// Stop after this migration id (inclusive)
        #[arg(long)]
        target: Option<String>,

        /// Plan without executing
        #[arg(long)]
        dry_run: bool,

        /// JSON context recorded with each execution
        #[arg(long)]
        context: Option<String>,
    },

    /// Roll back one applied migration
    Rollback {
        /// Migration id to roll back
        migration_id: String,

        /// Database the migration belongs to
        #[arg(long)]
        database: String,

        /// JSON context recorded with the execution
        #[arg(long)]
        context: Option<String>,
    },

    /// Show migration status (applied vs pending)
    Status {
        /// Limit to one database (default: all registered)
        #[arg(long)]
        database: Option<String>,
    },

    /// Capture a schema snapshot
    Snapshot {
        /// Database to snapshot
        #[arg(long)]
        database: String,
    },

    /// Run integrity checks (checksums, locks, schema drift)
    Verify {
        /// Database to check
        #[arg(long)]
        database: String,

        /// Remove expired locks that the checks find
        #[arg(long)]
        fix_drift: bool,
    },
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    if cli.quiet {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error")).init();
    } else if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let environment = match Environment::parse(&cli.environment) {
        Ok(environment) => environment,
        Err(e) => {
            eprintln!("❌ {}", e);
            process::exit(2);
        }
    };

    // Get database URL
    let database_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("TIDEMARK_DATABASE_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok());
    let Some(database_url) = database_url else {
        eprintln!("Error: Database URL not provided. Use --database-url or set TIDEMARK_DATABASE_URL or DATABASE_URL environment variable.");
        process::exit(2);
    };

    // Connect to database
    let client = match connect(&database_url) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("❌ Error connecting to database: {}", e);
            process::exit(1);
        }
    };

    let mut options = MigratorOptions::default();
    options.migrations_dir = cli.migrations_dir.clone();
    if let Ok(redis_url) = std::env::var("TIDEMARK_REDIS_URL") {
        match RedisStore::connect(&redis_url) {
            Ok(store) => {
                options = options
                    .with_replicator(Replicator::spawn(Box::new(store), ReplicatorOptions::default()));
            }
            Err(e) => {
                log::warn!("Mirror store unavailable, continuing without it: {e}");
            }
        }
    }

    let migrator = Migrator::new(MayPostgresExecutor::new(client), options);

    // Every command needs the ledger tables in place.
    if let Err(e) = migrator.initialize_ledger() {
        eprintln!("❌ Error initializing ledger tables: {}", e);
        process::exit(1);
    }

    let executed_by = std::env::var("USER").unwrap_or_else(|_| "tidemark-cli".to_string());

    // Execute command
    let result = match &cli.command {
        Commands::Init => handle_init(),
        Commands::Create {
            name,
            database,
            author,
            description,
            depends_on,
            tags,
        } => handle_create(
            &migrator,
            name,
            database,
            author,
            description.as_deref(),
            depends_on.clone(),
            tags.clone(),
        ),
        Commands::Run {
            database,
            target,
            dry_run,
            context,
        } => handle_run(
            &migrator,
            database,
            environment,
            &executed_by,
            target.as_deref(),
            *dry_run,
            context.as_deref(),
        ),
        Commands::Rollback {
            migration_id,
            database,
            context,
        } => handle_rollback(
            &migrator,
            database,
            migration_id,
            environment,
            &executed_by,
            context.as_deref(),
        ),
        Commands::Status { database } => handle_status(&migrator, database.as_deref(), environment),
        Commands::Snapshot { database } => {
            handle_snapshot(&migrator, database, environment, &executed_by)
        }
        Commands::Verify {
            database,
            fix_drift,
        } => handle_verify(&migrator, database, environment, *fix_drift),
    };

    // Drain the mirror queue before the process exits
    migrator.close();

    match result {
        Ok(true) => {
            if !cli.quiet {
                println!("✅ Success");
            }
            process::exit(0);
        }
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            process::exit(1);
        }
    }
}

fn handle_init() -> Result<bool, MigrationError> {
    // The ledger was created before dispatch; this just confirms it.
    println!("✅ Ledger tables are in place");
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
fn handle_create(
    migrator: &Migrator,
    name: &str,
    database: &str,
    author: &str,
    description: Option<&str>,
    depends_on: Vec<String>,
    tags: Vec<String>,
) -> Result<bool, MigrationError> {
    let mut draft = MigrationDraft::new(name, database, author)
        .with_depends_on(depends_on)
        .with_tags(tags);
    if let Some(description) = description {
        draft = draft.with_description(description);
    }

    let created = migrator.create_migration(draft)?;
    println!("✅ Registered migration '{}'", created.migration_id);
    println!("   Script file: {}", created.file_path.display());
    println!("   {}", created.message);
    Ok(true)
}

fn parse_context(context: Option<&str>) -> Result<Option<serde_json::Value>, MigrationError> {
    match context {
        Some(raw) => {
            let value = serde_json::from_str(raw)
                .map_err(|e| MigrationError::Validation(format!("--context is not valid JSON: {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn handle_run(
    migrator: &Migrator,
    database: &str,
    environment: Environment,
    executed_by: &str,
    target: Option<&str>,
    dry_run: bool,
    context: Option<&str>,
) -> Result<bool, MigrationError> {
    let mut options = RunOptions::new(environment, executed_by);
    if let Some(target) = target {
        options = options.with_target(target);
    }
    if dry_run {
        options = options.dry_run();
        println!("Planning migrations for '{database}' ({environment}, dry run)...");
    } else {
        println!("Applying migrations for '{database}' ({environment})...");
    }
    if let Some(context) = parse_context(context)? {
        options = options.with_context(context);
    }

    let result = migrator.run_migrations(database, &options)?;

    for executed in &result.executed_migrations {
        match executed.status {
            ExecutionStatus::Failed => println!(
                "  ✗ {} ({}ms): {}",
                executed.migration_id,
                executed.duration_ms,
                executed.error.as_deref().unwrap_or("unknown error")
            ),
            _ => println!("  ✓ {} ({}ms)", executed.migration_id, executed.duration_ms),
        }
    }
    for skipped in &result.skipped_migrations {
        println!("  ⏳ {} (skipped: {})", skipped.migration_id, skipped.reason);
    }

    if let Some(failed) = &result.failed_migration {
        eprintln!("❌ Migration '{}' failed; later migrations were skipped", failed);
        return Ok(false);
    }

    println!(
        "✅ {} executed, {} skipped in {}ms",
        result.executed_migrations.len(),
        result.skipped_migrations.len(),
        result.total_duration_ms
    );
    Ok(true)
}

fn handle_rollback(
    migrator: &Migrator,
    database: &str,
    migration_id: &str,
    environment: Environment,
    executed_by: &str,
    context: Option<&str>,
) -> Result<bool, MigrationError> {
    let mut options = RollbackOptions::new(environment, executed_by);
    if let Some(context) = parse_context(context)? {
        options = options.with_context(context);
    }

    println!("Rolling back '{migration_id}' on '{database}' ({environment})...");
    let result = migrator.rollback_migration(database, migration_id, &options)?;

    if result.success {
        println!("✅ Rolled back '{}' in {}ms", result.migration_id, result.duration_ms);
        Ok(true)
    } else {
        eprintln!(
            "❌ Rollback of '{}' failed: {}",
            result.migration_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
        Ok(false)
    }
}

fn handle_status(
    migrator: &Migrator,
    database: Option<&str>,
    environment: Environment,
) -> Result<bool, MigrationError> {
    let statuses = migrator.status(database, Some(environment))?;

    println!("\n📊 Migration Status ({environment})\n");

    if statuses.is_empty() {
        println!("No migrations registered");
        return Ok(true);
    }

    for status in &statuses {
        println!("Database: {}", status.database_id);
        for row in &status.migrations {
            println!(
                "  {}  dev={}  prod={}  {}",
                row.migration_id,
                paint_state(row.dev),
                paint_state(row.prod),
                row.description
            );
        }
        println!(
            "  📈 {} applied, {} pending of {} total",
            status.applied_migrations, status.pending_migrations, status.total_migrations
        );
        if let Some(at) = status.last_migration_at {
            println!("  Last applied: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        println!();
    }

    Ok(true)
}

fn paint_state(state: MigrationState) -> colored::ColoredString {
    match state {
        MigrationState::Applied => state.as_str().green(),
        MigrationState::Pending => state.as_str().yellow(),
    }
}

/// Leading 12 hex chars of a checksum, or all of it when a tampered ledger
/// row holds something shorter.
fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn handle_snapshot(
    migrator: &Migrator,
    database: &str,
    environment: Environment,
    executed_by: &str,
) -> Result<bool, MigrationError> {
    println!("Capturing schema snapshot of '{database}' ({environment})...");
    let result =
        migrator.capture_snapshot(database, environment, CaptureType::Manual, None, executed_by)?;

    println!(
        "✅ Snapshot {} captured: {} table(s), hash {}",
        result.snapshot_id,
        result.table_count,
        short_hash(&result.schema_hash)
    );
    if let Some(document_id) = &result.backup_document_id {
        println!("   Mirrored as {}", document_id);
    }
    Ok(true)
}

fn handle_verify(
    migrator: &Migrator,
    database: &str,
    environment: Environment,
    fix_drift: bool,
) -> Result<bool, MigrationError> {
    println!("Verifying '{database}' ({environment})...");
    let report = migrator.verify(database, environment, fix_drift)?;

    if report.issues.is_empty() {
        println!("✅ No integrity issues found");
        return Ok(true);
    }

    for issue in &report.issues {
        let severity = match issue.severity {
            Severity::Error => "error".red(),
            Severity::Warning => "warning".yellow(),
        };
        println!("  [{}] {}: {}", severity, issue.issue_type.as_str(), issue.detail);
    }
    for mismatch in &report.checksum_mismatches {
        println!(
            "    '{}': registered {} vs calculated {}",
            mismatch.migration_id,
            short_hash(&mismatch.registered_checksum),
            short_hash(&mismatch.calculated_checksum)
        );
    }
    if let Some(drift) = &report.schema_drift {
        println!(
            "    snapshot {} from {} no longer matches the live schema",
            drift.snapshot_id,
            drift.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if report.is_valid {
        println!("✅ Valid (warnings above)");
        Ok(true)
    } else {
        eprintln!("❌ Integrity check failed");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_context_accepts_json_object() {
        let parsed = parse_context(Some(r#"{"ticket": "OPS-12"}"#)).unwrap();
        assert_eq!(parsed.unwrap()["ticket"], "OPS-12");
    }

    #[test]
    fn test_parse_context_rejects_garbage() {
        assert!(parse_context(Some("not json")).is_err());
    }

    #[test]
    fn test_parse_context_none_passthrough() {
        assert!(parse_context(None).unwrap().is_none());
    }

    #[test]
    fn test_short_hash_never_panics_on_short_input() {
        assert_eq!(
            short_hash("e3b0c44298fc1c149afbf4c8996fb924"),
            "e3b0c44298fc"
        );
        assert_eq!(short_hash("abc"), "abc");
        assert_eq!(short_hash(""), "");
    }
}
