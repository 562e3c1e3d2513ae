//! Migration script files.
//!
//! Registration writes a working-copy `.sql` file per migration at
//! `<migrations_dir>/<database_id>/<migration_id>.sql`. The ledger row is
//! authoritative; the file exists for human review and version control and
//! is never read back for correctness decisions.

use std::fs;
use std::path::{Path, PathBuf};

use super::error::MigrationError;
use super::types::Migration;

pub const UP_MARKER: &str = "-- tidemark:up";
pub const DOWN_MARKER: &str = "-- tidemark:down";

/// Boilerplate forward script used when a migration is registered without
/// one. Executable as-is.
pub fn default_up_template(description: &str) -> String {
    format!(
        "-- {description}\n\
         -- Replace this placeholder with the forward schema change.\n\
         SELECT 1;\n"
    )
}

/// Renders the full on-disk form of a migration, sections fenced by
/// `-- tidemark:up` / `-- tidemark:down` markers. Irreversible migrations
/// carry no down section.
pub fn render_migration_file(migration: &Migration) -> String {
    let mut out = String::new();
    out.push_str(&format!("-- Migration: {}\n", migration.migration_id));
    out.push_str(&format!("-- Database: {}\n", migration.database_id));
    out.push_str(&format!("-- Author: {}\n", migration.author));
    out.push_str(&format!(
        "-- Created: {}\n",
        migration.created_at.to_rfc3339()
    ));
    if !migration.description.is_empty() {
        out.push_str(&format!("-- {}\n", migration.description));
    }
    out.push('\n');
    out.push_str(UP_MARKER);
    out.push('\n');
    out.push_str(&migration.up_script);
    if !migration.up_script.ends_with('\n') {
        out.push('\n');
    }
    if let Some(down) = &migration.down_script {
        out.push('\n');
        out.push_str(DOWN_MARKER);
        out.push('\n');
        out.push_str(down);
        if !down.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Where a migration's script file lives, whether or not it exists yet.
pub fn migration_file_path(
    migrations_dir: &Path,
    database_id: &str,
    migration_id: &str,
) -> PathBuf {
    migrations_dir
        .join(database_id)
        .join(format!("{migration_id}.sql"))
}

/// Writes the rendered migration file, creating the per-database directory
/// as needed.
pub fn write_migration_file(
    migrations_dir: &Path,
    migration: &Migration,
) -> Result<PathBuf, MigrationError> {
    let dir = migrations_dir.join(&migration.database_id);
    fs::create_dir_all(&dir).map_err(|e| {
        MigrationError::Io(format!("Failed to create {}: {e}", dir.display()))
    })?;
    let path = dir.join(format!("{}.sql", migration.migration_id));
    fs::write(&path, render_migration_file(migration)).map_err(|e| {
        MigrationError::Io(format!("Failed to write {}: {e}", path.display()))
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(down: Option<&str>) -> Migration {
        Migration {
            database_id: "billing".to_string(),
            migration_id: "20250101_083015_add_invoices".to_string(),
            description: "Add invoices table".to_string(),
            up_script: "CREATE TABLE invoices (id BIGINT PRIMARY KEY)".to_string(),
            down_script: down.map(str::to_string),
            checksum: "abc".to_string(),
            author: "alice".to_string(),
            created_at: Utc::now(),
            is_reversible: down.is_some(),
            depends_on: vec![],
            tags: vec![],
        }
    }

    #[test]
    fn test_render_reversible_migration() {
        let rendered = render_migration_file(&sample(Some("DROP TABLE invoices")));
        assert!(rendered.contains(UP_MARKER));
        assert!(rendered.contains(DOWN_MARKER));
        assert!(rendered.contains("CREATE TABLE invoices"));
        assert!(rendered.contains("DROP TABLE invoices"));
        let up_at = rendered.find(UP_MARKER).unwrap();
        let down_at = rendered.find(DOWN_MARKER).unwrap();
        assert!(up_at < down_at, "up section must come first");
    }

    #[test]
    fn test_render_irreversible_migration_has_no_down_section() {
        let rendered = render_migration_file(&sample(None));
        assert!(rendered.contains(UP_MARKER));
        assert!(!rendered.contains(DOWN_MARKER));
    }

    #[test]
    fn test_write_creates_per_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let migration = sample(Some("DROP TABLE invoices"));
        let path = write_migration_file(dir.path(), &migration).unwrap();
        assert_eq!(
            path,
            migration_file_path(dir.path(), "billing", "20250101_083015_add_invoices")
        );
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("-- Migration: 20250101_083015_add_invoices"));
    }

    #[test]
    fn test_default_up_template_is_executable() {
        let template = default_up_template("Add invoices table");
        assert!(template.contains("Add invoices table"));
        assert!(template.contains("SELECT 1;"));
    }
}
