//! Database row types — these map directly to SQLite rows.
//! Distinct from corridor-types models to keep the store independent.

use chrono::{DateTime, Utc};

pub struct ProfileRow {
    pub id: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub unit_id: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub name: Option<String>,
    pub kind: String,
    pub unit_id: Option<String>,
    /// JSON array of unit ids, or NULL.
    pub applicable_units: Option<String>,
    pub active: bool,
    pub created_by: String,
    pub created_at: String,
    pub direct_key: Option<String>,
    pub last_message_id: Option<String>,
    pub last_message_content: Option<String>,
    pub last_message_author: Option<String>,
    pub last_message_at: Option<String>,
}

/// A conversation as the directory query returns it: the row plus the
/// resolved display name and the caller's unread count.
pub struct DirectoryRow {
    pub conversation: ConversationRow,
    pub display_name: String,
    pub unread: i64,
}

pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub joined_at: String,
    pub left_at: Option<String>,
    pub last_read_at: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
    pub edited_at: Option<String>,
    pub deleted: bool,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_mime: Option<String>,
    pub attachment_size: Option<i64>,
}

/// Canonical timestamp format for TEXT columns: RFC 3339 UTC with a fixed
/// six-digit fractional part, so lexicographic order is chronological
/// order. `created_at` comparisons in SQL rely on this.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
