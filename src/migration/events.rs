//! Append-only change-event audit log.

use super::types::{Environment, EventType};
use crate::TideExecutor;

/// Writes one audit event. Best-effort by contract: the audit trail must
/// survive partial failures elsewhere, so this never propagates its own
/// failure either; it warns and moves on.
pub fn record_event(
    executor: &dyn TideExecutor,
    migration_id: &str,
    database_id: &str,
    event_type: EventType,
    environment: Environment,
    context: Option<&serde_json::Value>,
) {
    let context_text = match context {
        Some(value) => value.to_string(),
        None => "{}".to_string(),
    };
    let result = executor.execute(
        "INSERT INTO tidemark_events \
         (migration_id, database_id, event_type, environment, context, created_at) \
         VALUES ($1, $2, $3, $4, $5, NOW())",
        &[
            &migration_id,
            &database_id,
            &event_type.as_str(),
            &environment.as_str(),
            &context_text,
        ],
    );
    if let Err(e) = result {
        log::warn!(
            "Failed to record '{}' event for migration '{migration_id}': {e}",
            event_type.as_str()
        );
    }
}
