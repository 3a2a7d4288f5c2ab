use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, Participant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Conversations,
    Participants,
    Messages,
}

/// Row-change events pushed over the dispatcher after every successful
/// write, carrying the full new row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Change {
    /// A conversation row was created
    ConversationInserted { conversation: Conversation },

    /// A conversation row changed (rename, archive, last-message snapshot)
    ConversationUpdated { conversation: Conversation },

    /// A participant row was created
    ParticipantInserted { participant: Participant },

    /// A participant row changed (left, read marker moved)
    ParticipantUpdated { participant: Participant },

    /// A new message was posted
    MessageInserted { message: Message },

    /// A message was edited or soft-deleted
    MessageUpdated { message: Message },
}

impl Change {
    pub fn table(&self) -> Table {
        match self {
            Self::ConversationInserted { .. } | Self::ConversationUpdated { .. } => {
                Table::Conversations
            }
            Self::ParticipantInserted { .. } | Self::ParticipantUpdated { .. } => {
                Table::Participants
            }
            Self::MessageInserted { .. } | Self::MessageUpdated { .. } => Table::Messages,
        }
    }

    /// The conversation this change is scoped to. Every row in the schema
    /// belongs to exactly one conversation.
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::ConversationInserted { conversation }
            | Self::ConversationUpdated { conversation } => conversation.id,
            Self::ParticipantInserted { participant }
            | Self::ParticipantUpdated { participant } => participant.conversation_id,
            Self::MessageInserted { message } | Self::MessageUpdated { message } => {
                message.conversation_id
            }
        }
    }
}

/// Subscription filter in the manner of Postgres-changes channels: by
/// table, and optionally by equality on the conversation column. An empty
/// filter matches everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeFilter {
    pub table: Option<Table>,
    pub conversation: Option<Uuid>,
}

impl ChangeFilter {
    /// Matches every change on every table.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_table(table: Table) -> Self {
        Self {
            table: Some(table),
            conversation: None,
        }
    }

    pub fn for_conversation(table: Table, conversation: Uuid) -> Self {
        Self {
            table: Some(table),
            conversation: Some(conversation),
        }
    }

    pub fn matches(&self, change: &Change) -> bool {
        self.table.is_none_or(|t| t == change.table())
            && self.conversation.is_none_or(|c| c == change.conversation_id())
    }
}

/// Ephemeral broadcast signals. Never persisted, never replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Signal {
    /// A user started (or is still) typing in a conversation
    TypingStart { conversation_id: Uuid, user_id: Uuid },

    /// A user stopped typing
    TypingStop { conversation_id: Uuid, user_id: Uuid },
}

impl Signal {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::TypingStart { conversation_id, .. }
            | Self::TypingStop { conversation_id, .. } => *conversation_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            Self::TypingStart { user_id, .. } | Self::TypingStop { user_id, .. } => *user_id,
        }
    }
}

/// A named presence scope. The global scope backs the sidebar's online
/// dots; each open room runs its own scope. Scopes never share state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceScope {
    Global,
    Room(Uuid),
}

impl std::fmt::Display for PresenceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Room(id) => write!(f, "room:{id}"),
        }
    }
}

/// A tracked member of a presence scope. The payload is opaque to the
/// transport — clients put display data in it, the dispatcher only relays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMember {
    pub user_id: Uuid,
    pub payload: serde_json::Value,
}

/// Presence protocol events, delivered per scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresenceEvent {
    /// Full replace from the server-reported member set. Always the first
    /// event a new subscriber sees.
    Sync { members: Vec<PresenceMember> },

    /// A member joined the scope (union)
    Join { member: PresenceMember },

    /// A member left the scope or disconnected (difference)
    Leave { member: PresenceMember },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use chrono::Utc;

    fn message(conversation_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: "hi".into(),
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
            attachment: None,
        }
    }

    #[test]
    fn filter_matches_by_table_and_conversation() {
        let cid = Uuid::new_v4();
        let change = Change::MessageInserted { message: message(cid) };

        assert!(ChangeFilter::any().matches(&change));
        assert!(ChangeFilter::for_table(Table::Messages).matches(&change));
        assert!(!ChangeFilter::for_table(Table::Conversations).matches(&change));
        assert!(ChangeFilter::for_conversation(Table::Messages, cid).matches(&change));
        assert!(!ChangeFilter::for_conversation(Table::Messages, Uuid::new_v4()).matches(&change));
    }

    #[test]
    fn scope_display_is_stable() {
        let id: Uuid = "6a9f9d3e-33a0-4e0b-8f5a-90b2ffd4c3de".parse().unwrap();
        assert_eq!(PresenceScope::Global.to_string(), "global");
        assert_eq!(
            PresenceScope::Room(id).to_string(),
            "room:6a9f9d3e-33a0-4e0b-8f5a-90b2ffd4c3de"
        );
    }
}
