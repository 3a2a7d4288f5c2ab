use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// 1:1 chat between exactly two users. No name of its own; the display
    /// name is derived from the peer at render time.
    Direct,
    /// Room owned by an organizational unit (a ward, a department).
    Unit,
    /// Free-form named room.
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Unit => "unit",
            Self::Group => "group",
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "unit" => Ok(Self::Unit),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }
}

impl std::str::FromStr for ParticipantRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "member" => Ok(Self::Member),
            other => Err(format!("unknown participant role: {other}")),
        }
    }
}

/// Snapshot of the newest message, denormalized onto the conversation row so
/// the directory never joins against the messages table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub id: Uuid,
    pub content: String,
    pub author: Uuid,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// None for direct chats.
    pub name: Option<String>,
    pub kind: ConversationKind,
    /// Owning unit for unit-scoped rooms.
    pub unit: Option<Uuid>,
    /// Additional units the room applies to (cross-department rooms).
    pub applicable_units: Option<Vec<Uuid>>,
    pub active: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_message: Option<LastMessage>,
}

/// A user is "in" a conversation iff a participant row exists with no
/// `left_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: u64,
}

/// `created_at` is the sort key and never changes; edits update `content`
/// and stamp `edited_at`, deletion is the soft `deleted` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// May be empty only when an attachment is present.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub attachment: Option<Attachment>,
}

/// Staff directory data. Not an account — identity arrives from the edge as
/// an opaque fact; this row only carries what the conversation UI needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    /// Phone number for the outbound phone-gateway notifier.
    pub phone: Option<String>,
    pub unit: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One directory row: the conversation plus everything the sidebar renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationOverview {
    pub conversation: Conversation,
    /// Room name, or the peer's display name for direct chats.
    pub display_name: String,
    /// Messages from others newer than my `last_read_at`.
    pub unread: u32,
}

/// Canonical key for a direct-conversation pair: the two user ids as
/// strings, smaller first, joined with ':'. Order-insensitive, so both
/// sides of a 1:1 chat resolve to the same key. The store keeps a unique
/// index over this for active direct rows.
pub fn direct_key(a: Uuid, b: Uuid) -> String {
    let (a, b) = (a.to_string(), b.to_string());
    if a <= b { format!("{a}:{b}") } else { format!("{b}:{a}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_is_order_insensitive() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_key(a, b), direct_key(b, a));
        assert_ne!(direct_key(a, b), direct_key(a, a));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            ConversationKind::Direct,
            ConversationKind::Unit,
            ConversationKind::Group,
        ] {
            assert_eq!(kind.as_str().parse::<ConversationKind>().unwrap(), kind);
        }
        assert!("hallway".parse::<ConversationKind>().is_err());
    }
}
