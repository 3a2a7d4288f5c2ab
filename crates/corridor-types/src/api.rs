use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::PresenceScope;
use crate::models::{ConversationKind, ConversationOverview, Message, Profile};

/// Commands sent FROM a client UI TO its session over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Force a directory refetch regardless of staleness
    Refresh,

    /// Request the contact list (users I have no active direct chat with)
    Contacts,

    /// Make a conversation the active one; loads its feed
    Select { conversation_id: Uuid },

    /// Page the active feed backwards
    LoadOlder,

    /// Replace the draft text for a conversation. Also counts as a
    /// keystroke for the typing signaler.
    Compose { conversation_id: Uuid, text: String },

    /// Stage a single attachment on the draft (bytes as base64)
    StageAttachment {
        conversation_id: Uuid,
        file_name: String,
        mime_type: String,
        data: String,
    },

    /// Drop the staged attachment
    ClearAttachment { conversation_id: Uuid },

    /// Send the draft of a conversation
    Send { conversation_id: Uuid },

    /// Open (or create) the 1:1 conversation with a user
    OpenDirect { user_id: Uuid },

    /// Create a named unit or group room
    CreateRoom {
        name: String,
        kind: ConversationKind,
        unit: Option<Uuid>,
        applicable_units: Option<Vec<Uuid>>,
        member_ids: Vec<Uuid>,
    },

    /// Move my read marker to now for a conversation
    MarkRead { conversation_id: Uuid },

    /// Replace a message's content (sender only)
    EditMessage { message_id: Uuid, content: String },

    /// Soft-delete a message (sender only)
    DeleteMessage { message_id: Uuid },

    /// Archive a conversation (frees its direct pair for re-creation)
    Archive { conversation_id: Uuid },

    /// Leave a group or unit room
    Leave { conversation_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedPhase {
    Empty,
    Loading,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Updates pushed FROM a session TO its client UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionUpdate {
    /// Session is connected and subscribed
    Ready { user_id: Uuid },

    /// Directory snapshot, most recent activity first. `stale` is set when
    /// the last refetch failed and this is the previous good list.
    Directory {
        entries: Vec<ConversationOverview>,
        stale: bool,
    },

    /// Contact list snapshot
    Contacts { profiles: Vec<Profile> },

    /// Feed snapshot for a conversation, oldest first. `exhausted` means
    /// backward pagination reached the start of history.
    Feed {
        conversation_id: Uuid,
        phase: FeedPhase,
        messages: Vec<Message>,
        exhausted: bool,
    },

    /// Online user set for a presence scope
    Presence {
        scope: PresenceScope,
        online: Vec<Uuid>,
    },

    /// Users currently typing in a conversation
    Typing {
        conversation_id: Uuid,
        user_ids: Vec<Uuid>,
    },

    /// Draft state for a conversation (also emitted when a failed send
    /// restores the draft, so input is never silently lost)
    Draft {
        conversation_id: Uuid,
        text: String,
        attachment_name: Option<String>,
    },

    /// A send resolved successfully
    Sent { message: Message },

    /// Result of OpenDirect/CreateRoom: the conversation to navigate to
    Opened { conversation_id: Uuid },

    /// Non-blocking notification (soft errors land here, never as a
    /// cleared screen)
    Notice { level: NoticeLevel, text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_shape_is_tagged() {
        let cmd = ClientCommand::Select {
            conversation_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "Select");
        assert_eq!(
            json["data"]["conversation_id"],
            "00000000-0000-0000-0000-000000000000"
        );
    }
}
