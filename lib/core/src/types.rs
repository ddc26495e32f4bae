use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result wrapper for list operations.
#[derive(Debug, Clone, Serialize)]
pub struct ListResult<T: Serialize> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Generate a new random ID (UUIDv4, no dashes).
///
/// Task IDs double as execution-queue job IDs, so they must be globally
/// unique across every queue.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string().replace('-', "")
}

/// Get the current time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp back into a UTC instant.
///
/// Returns `None` on malformed input rather than erroring — callers doing
/// age arithmetic treat an unparseable timestamp as "unknown age" and skip.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
