//! Migration id generation and validation.
//!
//! Ids take the form `YYYYMMDD_HHMMSS_<sanitized_name>` (UTC). The timestamp
//! prefix makes ascending lexical order equal creation order, which the
//! execution engine relies on.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::error::MigrationError;

static MIGRATION_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{8}_\d{6}_[a-z0-9_]+$").expect("migration id pattern is valid")
});

/// Lowercases a human name and collapses every non-alphanumeric run to a
/// single underscore. `"Add Users Table!"` becomes `"add_users_table"`.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_separator = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            out.push('_');
            last_was_separator = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Derives a migration id from a creation instant and a human name.
pub fn generate_migration_id(name: &str, created_at: DateTime<Utc>) -> Result<String, MigrationError> {
    let sanitized = sanitize_name(name);
    if sanitized.is_empty() {
        return Err(MigrationError::Validation(format!(
            "migration name '{name}' contains no usable characters"
        )));
    }
    Ok(format!("{}_{}", created_at.format("%Y%m%d_%H%M%S"), sanitized))
}

pub fn is_valid_migration_id(id: &str) -> bool {
    MIGRATION_ID_PATTERN.is_match(id)
}

/// Validates a caller-supplied migration id, for operations that look up an
/// existing migration.
pub fn validate_migration_id(id: &str) -> Result<(), MigrationError> {
    if is_valid_migration_id(id) {
        Ok(())
    } else {
        Err(MigrationError::InvalidId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Add Users Table"), "add_users_table");
        assert_eq!(sanitize_name("add-users--table!"), "add_users_table");
        assert_eq!(sanitize_name("  CamelCase99  "), "camelcase99");
        assert_eq!(sanitize_name("!!!"), "");
    }

    #[test]
    fn test_generate_migration_id() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 8, 30, 15).unwrap();
        let id = generate_migration_id("Add Users Table", at).unwrap();
        assert_eq!(id, "20250101_083015_add_users_table");
        assert!(is_valid_migration_id(&id));
    }

    #[test]
    fn test_generated_ids_sort_by_creation_time() {
        let earlier = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 3, 2, 7, 0, 0).unwrap();
        let a = generate_migration_id("zzz last by name", earlier).unwrap();
        let b = generate_migration_id("aaa first by name", later).unwrap();
        assert!(a < b, "timestamp prefix must dominate the ordering");
    }

    #[test]
    fn test_rejects_empty_name() {
        let err = generate_migration_id("***", Utc::now()).unwrap_err();
        assert!(matches!(err, MigrationError::Validation(_)));
    }

    #[test]
    fn test_validate_migration_id() {
        assert!(validate_migration_id("20250101_083015_add_users").is_ok());
        assert!(validate_migration_id("init").is_err());
        assert!(validate_migration_id("2025_01_01_add_users").is_err());
        assert!(validate_migration_id("20250101_083015_Add_Users").is_err());
    }
}
