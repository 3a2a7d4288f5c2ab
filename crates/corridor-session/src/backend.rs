use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use corridor_blobs::BlobStore;
use corridor_realtime::Dispatcher;
use corridor_store::Database;
use corridor_store::models::{
    ConversationRow, DirectoryRow, MessageRow, ParticipantRow, ProfileRow, format_ts, parse_ts,
};
use corridor_types::events::Change;
use corridor_types::models::{
    Attachment, Conversation, ConversationKind, ConversationOverview, LastMessage, Message,
    Participant, ParticipantRole, Profile, direct_key,
};

/// Shared handle to storage, blobs and fan-out. Every database call runs
/// off the async runtime via spawn_blocking; every successful write is
/// followed by a published [`Change`] carrying the full new row.
#[derive(Clone)]
pub struct Backend {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    blobs: Arc<BlobStore>,
}

impl Backend {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, blobs: BlobStore) -> Self {
        Self {
            db,
            dispatcher,
            blobs: Arc::new(blobs),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn max_attachment_bytes(&self) -> u64 {
        self.blobs.max_bytes()
    }

    /// Run blocking DB work off the async runtime.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                anyhow!("storage task failed")
            })?
    }

    // -- Profiles --

    /// Create or refresh the caller's profile on connect.
    pub async fn ensure_profile(
        &self,
        user_id: Uuid,
        display_name: &str,
        phone: Option<&str>,
        unit: Option<Uuid>,
    ) -> Result<Profile> {
        let uid = user_id.to_string();
        let name = display_name.to_string();
        let phone = phone.map(str::to_string);
        let unit_s = unit.map(|u| u.to_string());
        let now = Utc::now();
        let ts = format_ts(now);

        self.run(move |db| {
            db.upsert_profile(&uid, &name, phone.as_deref(), unit_s.as_deref(), &ts)?;
            db.get_profile(&uid)?
                .ok_or_else(|| anyhow!("profile {} vanished after upsert", uid))
        })
        .await
        .map(profile_from_row)
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>> {
        let uid = user_id.to_string();
        let row = self.run(move |db| db.get_profile(&uid)).await?;
        Ok(row.map(profile_from_row))
    }

    pub async fn contacts(&self, user_id: Uuid) -> Result<Vec<Profile>> {
        let uid = user_id.to_string();
        let rows = self.run(move |db| db.list_contacts(&uid)).await?;
        Ok(rows.into_iter().map(profile_from_row).collect())
    }

    // -- Conversations --

    pub async fn directory(&self, user_id: Uuid) -> Result<Vec<ConversationOverview>> {
        let uid = user_id.to_string();
        let rows = self.run(move |db| db.conversations_for_user(&uid)).await?;
        Ok(rows.into_iter().map(overview_from_row).collect())
    }

    pub async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let cid = id.to_string();
        let row = self.run(move |db| db.get_conversation(&cid)).await?;
        Ok(row.map(conversation_from_row))
    }

    /// Active direct conversation for a pair, if one exists.
    pub async fn find_direct(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
        let key = direct_key(a, b);
        let id = self.run(move |db| db.find_direct(&key)).await?;
        Ok(id.map(|s| parse_uuid(&s, "conversation id")))
    }

    /// Insert a direct conversation. The creator's attach must succeed; the
    /// peer's is best-effort and a failure is logged, not rolled back. A
    /// unique violation on the pair key comes back unwrapped so callers can
    /// detect it with [`corridor_store::is_unique_violation`] and
    /// re-resolve.
    pub async fn create_direct(&self, me: Uuid, peer: Uuid) -> Result<Conversation> {
        let conversation_id = Uuid::new_v4();
        let cid = conversation_id.to_string();
        let me_s = me.to_string();
        let peer_s = peer.to_string();
        let key = direct_key(me, peer);
        let ts = format_ts(Utc::now());

        let (row, peer_attached) = self
            .run(move |db| {
                db.insert_conversation(&cid, None, "direct", None, None, &me_s, &ts, Some(&key))?;
                db.insert_participant(&cid, &me_s, "owner", &ts)?;
                let peer_attached = match db.insert_participant(&cid, &peer_s, "member", &ts) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Could not attach {} to conversation {}: {}", peer_s, cid, e);
                        false
                    }
                };
                let row = db
                    .get_conversation(&cid)?
                    .ok_or_else(|| anyhow!("conversation {} vanished after insert", cid))?;
                Ok((row, peer_attached))
            })
            .await?;

        let conversation = conversation_from_row(row);
        self.dispatcher.publish(Change::ConversationInserted {
            conversation: conversation.clone(),
        });
        let mut members = vec![(me, ParticipantRole::Owner)];
        if peer_attached {
            members.push((peer, ParticipantRole::Member));
        }
        for (user, role) in members {
            self.dispatcher.publish(Change::ParticipantInserted {
                participant: Participant {
                    conversation_id,
                    user_id: user,
                    role,
                    joined_at: conversation.created_at,
                    left_at: None,
                    last_read_at: None,
                },
            });
        }
        Ok(conversation)
    }

    /// Insert a named room and attach members. The creator's attach must
    /// succeed; the rest are best-effort and failures are returned, not
    /// rolled back.
    pub async fn create_room(
        &self,
        me: Uuid,
        name: &str,
        kind: ConversationKind,
        unit: Option<Uuid>,
        applicable_units: Option<Vec<Uuid>>,
        member_ids: Vec<Uuid>,
    ) -> Result<(Conversation, Vec<Uuid>, Vec<Uuid>)> {
        let conversation_id = Uuid::new_v4();
        let cid = conversation_id.to_string();
        let me_s = me.to_string();
        let name = name.to_string();
        let kind_s = kind.as_str();
        let unit_s = unit.map(|u| u.to_string());
        let units_json = match &applicable_units {
            Some(units) => Some(serde_json::to_string(units)?),
            None => None,
        };
        let members: Vec<(Uuid, String)> = member_ids
            .into_iter()
            .filter(|m| *m != me)
            .map(|m| (m, m.to_string()))
            .collect();
        let now = Utc::now();
        let ts = format_ts(now);

        let (row, attached, failed) = self
            .run(move |db| {
                db.insert_conversation(
                    &cid,
                    Some(&name),
                    kind_s,
                    unit_s.as_deref(),
                    units_json.as_deref(),
                    &me_s,
                    &ts,
                    None,
                )?;
                db.insert_participant(&cid, &me_s, "owner", &ts)?;

                let mut attached = Vec::new();
                let mut failed = Vec::new();
                for (member, member_s) in &members {
                    match db.insert_participant(&cid, member_s, "member", &ts) {
                        Ok(()) => attached.push(*member),
                        Err(e) => {
                            warn!("Could not attach {} to conversation {}: {}", member_s, cid, e);
                            failed.push(*member);
                        }
                    }
                }

                let row = db
                    .get_conversation(&cid)?
                    .ok_or_else(|| anyhow!("conversation {} vanished after insert", cid))?;
                Ok((row, attached, failed))
            })
            .await?;

        let conversation = conversation_from_row(row);
        self.dispatcher.publish(Change::ConversationInserted {
            conversation: conversation.clone(),
        });
        self.dispatcher.publish(Change::ParticipantInserted {
            participant: Participant {
                conversation_id,
                user_id: me,
                role: ParticipantRole::Owner,
                joined_at: now,
                left_at: None,
                last_read_at: None,
            },
        });
        for member in &attached {
            self.dispatcher.publish(Change::ParticipantInserted {
                participant: Participant {
                    conversation_id,
                    user_id: *member,
                    role: ParticipantRole::Member,
                    joined_at: now,
                    left_at: None,
                    last_read_at: None,
                },
            });
        }
        Ok((conversation, attached, failed))
    }

    /// Archive a conversation. Current participants only. Its direct pair
    /// (if any) becomes free for re-creation because the unique index only
    /// covers active rows.
    pub async fn archive(&self, conversation_id: Uuid, requester: Uuid) -> Result<Conversation> {
        let cid = conversation_id.to_string();
        let uid = requester.to_string();
        let row = self
            .run(move |db| {
                let member = db
                    .get_participant(&cid, &uid)?
                    .is_some_and(|p| p.left_at.is_none());
                if !member {
                    bail!("{} is not a participant of {}", uid, cid);
                }
                if !db.set_conversation_active(&cid, false)? {
                    bail!("unknown conversation {}", cid);
                }
                db.get_conversation(&cid)?
                    .ok_or_else(|| anyhow!("conversation {} vanished after archive", cid))
            })
            .await?;

        let conversation = conversation_from_row(row);
        self.dispatcher.publish(Change::ConversationUpdated {
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }

    // -- Participants --

    pub async fn participants(&self, conversation_id: Uuid) -> Result<Vec<Participant>> {
        let cid = conversation_id.to_string();
        let rows = self.run(move |db| db.participants_of(&cid)).await?;
        Ok(rows.into_iter().map(participant_from_row).collect())
    }

    /// Leave a room. Direct conversations are archived instead, never
    /// half-left.
    pub async fn leave(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let cid = conversation_id.to_string();
        let uid = user_id.to_string();
        let ts = format_ts(Utc::now());

        let row = self
            .run(move |db| {
                let conv = db
                    .get_conversation(&cid)?
                    .ok_or_else(|| anyhow!("unknown conversation {}", cid))?;
                if conv.kind == "direct" {
                    bail!("a direct conversation is archived, not left");
                }
                if !db.set_left(&cid, &uid, &ts)? {
                    bail!("{} is not a participant of {}", uid, cid);
                }
                db.get_participant(&cid, &uid)?
                    .ok_or_else(|| anyhow!("participant row vanished after update"))
            })
            .await?;

        self.dispatcher.publish(Change::ParticipantUpdated {
            participant: participant_from_row(row),
        });
        Ok(())
    }

    /// Move the user's read marker to now.
    pub async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let cid = conversation_id.to_string();
        let uid = user_id.to_string();
        let ts = format_ts(Utc::now());

        let row = self
            .run(move |db| {
                if !db.set_last_read(&cid, &uid, &ts)? {
                    bail!("{} is not a participant of {}", uid, cid);
                }
                db.get_participant(&cid, &uid)?
                    .ok_or_else(|| anyhow!("participant row vanished after update"))
            })
            .await?;

        self.dispatcher.publish(Change::ParticipantUpdated {
            participant: participant_from_row(row),
        });
        Ok(())
    }

    // -- Messages --

    /// Oldest-first window of messages. `before` is the `(created_at, id)`
    /// of the oldest already-loaded message; None fetches the newest window.
    pub async fn messages_before(
        &self,
        conversation_id: Uuid,
        limit: u32,
        before: Option<(DateTime<Utc>, Uuid)>,
    ) -> Result<Vec<Message>> {
        let cid = conversation_id.to_string();
        let cursor = before.map(|(at, id)| (format_ts(at), id.to_string()));

        let mut rows = self
            .run(move |db| {
                db.messages_window(&cid, limit, cursor.as_ref().map(|(at, id)| (at.as_str(), id.as_str())))
            })
            .await?;

        rows.reverse();
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    /// Persist a message and refresh the conversation's last-message
    /// snapshot, then publish both changes.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<Message> {
        let message_id = Uuid::new_v4();
        let mid = message_id.to_string();
        let cid = conversation_id.to_string();
        let sender_s = sender.to_string();
        let content = content.trim().to_string();
        let now = Utc::now();
        let ts = format_ts(now);

        let att = attachment.clone();
        let preview = if content.is_empty() {
            attachment
                .as_ref()
                .map(|a| a.file_name.clone())
                .unwrap_or_default()
        } else {
            content.clone()
        };

        let row = self
            .run({
                let content = content.clone();
                move |db| {
                    db.insert_message(
                        &mid,
                        &cid,
                        &sender_s,
                        &content,
                        &ts,
                        att.as_ref().map(|a| a.url.as_str()),
                        att.as_ref().map(|a| a.file_name.as_str()),
                        att.as_ref().map(|a| a.mime_type.as_str()),
                        att.as_ref().map(|a| a.byte_size as i64),
                    )?;
                    db.update_last_message(&cid, &mid, &preview, &sender_s, &ts)?;
                    db.get_conversation(&cid)?
                        .ok_or_else(|| anyhow!("conversation {} vanished on send", cid))
                }
            })
            .await?;

        let message = Message {
            id: message_id,
            conversation_id,
            sender_id: sender,
            content,
            created_at: now,
            edited_at: None,
            deleted: false,
            attachment,
        };

        self.dispatcher.publish(Change::MessageInserted {
            message: message.clone(),
        });
        self.dispatcher.publish(Change::ConversationUpdated {
            conversation: conversation_from_row(row),
        });
        Ok(message)
    }

    /// Replace a message's content. Sender-only; `created_at` never moves.
    pub async fn edit_message(&self, message_id: Uuid, editor: Uuid, content: &str) -> Result<Message> {
        let mid = message_id.to_string();
        let editor_s = editor.to_string();
        let content = content.trim().to_string();
        let ts = format_ts(Utc::now());

        let (message_row, conversation_row) = self
            .run(move |db| {
                let row = db
                    .get_message(&mid)?
                    .ok_or_else(|| anyhow!("unknown message {}", mid))?;
                if row.sender_id != editor_s {
                    bail!("only the sender can edit a message");
                }
                if row.deleted {
                    bail!("the message was deleted");
                }
                if !db.update_message_content(&mid, &content, &ts)? {
                    bail!("unknown message {}", mid);
                }

                // Keep the directory preview honest when the newest message
                // is the one being edited.
                let conv = db
                    .get_conversation(&row.conversation_id)?
                    .ok_or_else(|| anyhow!("conversation {} vanished", row.conversation_id))?;
                let conversation_row = if conv.last_message_id.as_deref() == Some(mid.as_str()) {
                    let at = conv.last_message_at.clone().unwrap_or_else(|| row.created_at.clone());
                    db.update_last_message(&row.conversation_id, &mid, &content, &row.sender_id, &at)?;
                    db.get_conversation(&row.conversation_id)?
                } else {
                    None
                };

                let row = db
                    .get_message(&mid)?
                    .ok_or_else(|| anyhow!("message {} vanished after edit", mid))?;
                Ok((row, conversation_row))
            })
            .await?;

        let message = message_from_row(message_row);
        self.dispatcher.publish(Change::MessageUpdated {
            message: message.clone(),
        });
        if let Some(row) = conversation_row {
            self.dispatcher.publish(Change::ConversationUpdated {
                conversation: conversation_from_row(row),
            });
        }
        Ok(message)
    }

    /// Soft-delete a message. Sender-only.
    pub async fn delete_message(&self, message_id: Uuid, requester: Uuid) -> Result<Message> {
        let mid = message_id.to_string();
        let requester_s = requester.to_string();

        let (message_row, conversation_row) = self
            .run(move |db| {
                let row = db
                    .get_message(&mid)?
                    .ok_or_else(|| anyhow!("unknown message {}", mid))?;
                if row.sender_id != requester_s {
                    bail!("only the sender can delete a message");
                }
                if !db.mark_message_deleted(&mid)? {
                    bail!("unknown message {}", mid);
                }

                let conv = db
                    .get_conversation(&row.conversation_id)?
                    .ok_or_else(|| anyhow!("conversation {} vanished", row.conversation_id))?;
                let conversation_row = if conv.last_message_id.as_deref() == Some(mid.as_str()) {
                    let at = conv.last_message_at.clone().unwrap_or_else(|| row.created_at.clone());
                    db.update_last_message(
                        &row.conversation_id,
                        &mid,
                        "Message deleted",
                        &row.sender_id,
                        &at,
                    )?;
                    db.get_conversation(&row.conversation_id)?
                } else {
                    None
                };

                let row = db
                    .get_message(&mid)?
                    .ok_or_else(|| anyhow!("message {} vanished after delete", mid))?;
                Ok((row, conversation_row))
            })
            .await?;

        let message = message_from_row(message_row);
        self.dispatcher.publish(Change::MessageUpdated {
            message: message.clone(),
        });
        if let Some(row) = conversation_row {
            self.dispatcher.publish(Change::ConversationUpdated {
                conversation: conversation_from_row(row),
            });
        }
        Ok(message)
    }

    // -- Blobs --

    pub async fn upload(&self, file_name: &str, mime_type: &str, data: &[u8]) -> Result<Attachment> {
        self.blobs.put(file_name, mime_type, data).await
    }

    /// Best-effort removal of an uploaded blob whose message never landed.
    pub async fn discard_upload(&self, url: &str) {
        if let Err(e) = self.blobs.delete(url).await {
            warn!("Could not discard orphaned upload {}: {}", url, e);
        }
    }
}

// -- Row mapping --
//
// Rows keep ids and timestamps as TEXT; corrupt values are logged and
// replaced with defaults rather than dropping whole result sets.

fn parse_uuid(value: &str, what: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, value, e);
        Uuid::default()
    })
}

fn parse_time(value: &str, what: &str) -> DateTime<Utc> {
    parse_ts(value).unwrap_or_else(|| {
        warn!("Corrupt {} '{}'", what, value);
        DateTime::default()
    })
}

fn parse_kind(value: &str) -> ConversationKind {
    ConversationKind::from_str(value).unwrap_or_else(|e| {
        warn!("{}", e);
        ConversationKind::Group
    })
}

fn parse_role(value: &str) -> ParticipantRole {
    ParticipantRole::from_str(value).unwrap_or_else(|e| {
        warn!("{}", e);
        ParticipantRole::Member
    })
}

fn profile_from_row(row: ProfileRow) -> Profile {
    Profile {
        id: parse_uuid(&row.id, "profile id"),
        display_name: row.display_name,
        phone: row.phone,
        unit: row.unit_id.as_deref().map(|u| parse_uuid(u, "unit id")),
        created_at: parse_time(&row.created_at, "profile created_at"),
    }
}

fn conversation_from_row(row: ConversationRow) -> Conversation {
    let last_message = match (&row.last_message_id, &row.last_message_at) {
        (Some(id), Some(at)) => Some(LastMessage {
            id: parse_uuid(id, "last_message_id"),
            content: row.last_message_content.clone().unwrap_or_default(),
            author: row
                .last_message_author
                .as_deref()
                .map(|a| parse_uuid(a, "last_message_author"))
                .unwrap_or_default(),
            at: parse_time(at, "last_message_at"),
        }),
        _ => None,
    };

    let applicable_units = row.applicable_units.as_deref().and_then(|json| {
        serde_json::from_str::<Vec<Uuid>>(json)
            .map_err(|e| warn!("Corrupt applicable_units on {}: {}", row.id, e))
            .ok()
    });

    Conversation {
        id: parse_uuid(&row.id, "conversation id"),
        name: row.name,
        kind: parse_kind(&row.kind),
        unit: row.unit_id.as_deref().map(|u| parse_uuid(u, "unit id")),
        applicable_units,
        active: row.active,
        created_by: parse_uuid(&row.created_by, "created_by"),
        created_at: parse_time(&row.created_at, "conversation created_at"),
        last_message,
    }
}

fn overview_from_row(row: DirectoryRow) -> ConversationOverview {
    ConversationOverview {
        conversation: conversation_from_row(row.conversation),
        display_name: row.display_name,
        unread: row.unread.max(0) as u32,
    }
}

fn participant_from_row(row: ParticipantRow) -> Participant {
    Participant {
        conversation_id: parse_uuid(&row.conversation_id, "conversation id"),
        user_id: parse_uuid(&row.user_id, "user id"),
        role: parse_role(&row.role),
        joined_at: parse_time(&row.joined_at, "joined_at"),
        left_at: row.left_at.as_deref().map(|t| parse_time(t, "left_at")),
        last_read_at: row
            .last_read_at
            .as_deref()
            .map(|t| parse_time(t, "last_read_at")),
    }
}

fn message_from_row(row: MessageRow) -> Message {
    let attachment = row.attachment_url.as_ref().map(|url| Attachment {
        url: url.clone(),
        file_name: row.attachment_name.clone().unwrap_or_default(),
        mime_type: row.attachment_mime.clone().unwrap_or_default(),
        byte_size: row.attachment_size.unwrap_or(0).max(0) as u64,
    });

    Message {
        id: parse_uuid(&row.id, "message id"),
        conversation_id: parse_uuid(&row.conversation_id, "conversation id"),
        sender_id: parse_uuid(&row.sender_id, "sender id"),
        content: row.content,
        created_at: parse_time(&row.created_at, "message created_at"),
        edited_at: row.edited_at.as_deref().map(|t| parse_time(t, "edited_at")),
        deleted: row.deleted,
        attachment,
    }
}
