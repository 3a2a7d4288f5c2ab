use crate::Database;
use crate::models::{ConversationRow, DirectoryRow, MessageRow, ParticipantRow, ProfileRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Profiles --

    /// Create or refresh a staff profile. Identity arrives from the edge,
    /// so this is an upsert rather than a create.
    pub fn upsert_profile(
        &self,
        id: &str,
        display_name: &str,
        phone: Option<&str>,
        unit_id: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, display_name, phone, unit_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     display_name = excluded.display_name,
                     phone = excluded.phone,
                     unit_id = excluded.unit_id",
                rusqlite::params![id, display_name, phone, unit_id, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT id, display_name, phone, unit_id, created_at
                 FROM profiles WHERE id = ?1",
            )?
            .query_row([id], map_profile)
            .optional()
        })
    }

    /// Users the caller may still start a direct chat with: everyone except
    /// themselves and anyone they already share an active direct
    /// conversation with.
    pub fn list_contacts(&self, user_id: &str) -> Result<Vec<ProfileRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.display_name, p.phone, p.unit_id, p.created_at
                 FROM profiles p
                 WHERE p.id <> ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM conversations c
                       WHERE c.kind = 'direct'
                         AND c.active = 1
                         AND c.direct_key = CASE
                             WHEN p.id < ?1 THEN p.id || ':' || ?1
                             ELSE ?1 || ':' || p.id
                         END
                   )
                 ORDER BY p.display_name",
            )?;
            let rows = stmt
                .query_map([user_id], map_profile)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations --

    /// Plain insert. A unique-constraint failure on `direct_key` means the
    /// pair already has an active direct chat; callers detect it with
    /// [`crate::is_unique_violation`] and re-resolve instead of failing.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_conversation(
        &self,
        id: &str,
        name: Option<&str>,
        kind: &str,
        unit_id: Option<&str>,
        applicable_units: Option<&str>,
        created_by: &str,
        created_at: &str,
        direct_key: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations
                     (id, name, kind, unit_id, applicable_units, created_by, created_at, direct_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id,
                    name,
                    kind,
                    unit_id,
                    applicable_units,
                    created_by,
                    created_at,
                    direct_key
                ],
            )?;
            Ok(())
        })
    }

    /// Active direct conversation for a canonical pair key, if any.
    pub fn find_direct(&self, direct_key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.prepare("SELECT id FROM conversations WHERE direct_key = ?1 AND active = 1")?
                .query_row([direct_key], |row| row.get(0))
                .optional()
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            conn.prepare(&format!(
                "SELECT {CONVERSATION_COLS} FROM conversations c WHERE c.id = ?1"
            ))?
            .query_row([id], map_conversation)
            .optional()
        })
    }

    /// The directory: every active conversation the user has a live
    /// participant row in, newest activity first, with the resolved display
    /// name and the user's unread count.
    pub fn conversations_for_user(&self, user_id: &str) -> Result<Vec<DirectoryRow>> {
        self.with_conn(|conn| query_directory(conn, user_id))
    }

    pub fn set_conversation_active(&self, id: &str, active: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE conversations SET active = ?2 WHERE id = ?1",
                rusqlite::params![id, active],
            )?;
            Ok(n > 0)
        })
    }

    /// Refresh the denormalized last-message snapshot.
    pub fn update_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
        author: &str,
        at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations SET
                     last_message_id = ?2,
                     last_message_content = ?3,
                     last_message_author = ?4,
                     last_message_at = ?5
                 WHERE id = ?1",
                rusqlite::params![conversation_id, message_id, content, author, at],
            )?;
            Ok(())
        })
    }

    // -- Participants --

    /// Attach a user. Re-attaching someone who previously left clears
    /// their `left_at` (the re-invite path).
    pub fn insert_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: &str,
        joined_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO participants (conversation_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                     role = excluded.role,
                     joined_at = excluded.joined_at,
                     left_at = NULL",
                rusqlite::params![conversation_id, user_id, role, joined_at],
            )?;
            Ok(())
        })
    }

    pub fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ParticipantRow>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT conversation_id, user_id, role, joined_at, left_at, last_read_at
                 FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            )?
            .query_row([conversation_id, user_id], map_participant)
            .optional()
        })
    }

    /// Participants who have not left.
    pub fn participants_of(&self, conversation_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id, role, joined_at, left_at, last_read_at
                 FROM participants
                 WHERE conversation_id = ?1 AND left_at IS NULL
                 ORDER BY joined_at",
            )?;
            let rows = stmt
                .query_map([conversation_id], map_participant)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn set_left(&self, conversation_id: &str, user_id: &str, at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE participants SET left_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                rusqlite::params![conversation_id, user_id, at],
            )?;
            Ok(n > 0)
        })
    }

    pub fn set_last_read(&self, conversation_id: &str, user_id: &str, at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE participants SET last_read_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                rusqlite::params![conversation_id, user_id, at],
            )?;
            Ok(n > 0)
        })
    }

    // -- Messages --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        created_at: &str,
        attachment_url: Option<&str>,
        attachment_name: Option<&str>,
        attachment_mime: Option<&str>,
        attachment_size: Option<i64>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages
                     (id, conversation_id, sender_id, content, created_at,
                      attachment_url, attachment_name, attachment_mime, attachment_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id,
                    conversation_id,
                    sender_id,
                    content,
                    created_at,
                    attachment_url,
                    attachment_name,
                    attachment_mime,
                    attachment_size
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages m WHERE m.id = ?1"
            ))?
            .query_row([id], map_message)
            .optional()
        })
    }

    /// The newest `limit` messages older than the cursor, newest first
    /// (callers reverse for display). The cursor is the `(created_at, id)`
    /// of the oldest already-loaded message; None fetches the latest
    /// window.
    pub fn messages_window(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<(&str, &str)>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages m
                 WHERE m.conversation_id = ?1
                   AND (?2 IS NULL
                        OR m.created_at < ?2
                        OR (m.created_at = ?2 AND m.id < ?3))
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?4"
            ))?;
            let (before_ts, before_id) = match before {
                Some((ts, id)) => (Some(ts), Some(id)),
                None => (None, None),
            };
            let rows = stmt
                .query_map(
                    rusqlite::params![conversation_id, before_ts, before_id, limit],
                    map_message,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Edit a message's content. `created_at` (the sort key) never changes.
    pub fn update_message_content(&self, id: &str, content: &str, edited_at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?2, edited_at = ?3
                 WHERE id = ?1 AND deleted = 0",
                rusqlite::params![id, content, edited_at],
            )?;
            Ok(n > 0)
        })
    }

    pub fn mark_message_deleted(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("UPDATE messages SET deleted = 1 WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }
}

const CONVERSATION_COLS: &str = "c.id, c.name, c.kind, c.unit_id, c.applicable_units, c.active, \
     c.created_by, c.created_at, c.direct_key, c.last_message_id, c.last_message_content, \
     c.last_message_author, c.last_message_at";

const MESSAGE_COLS: &str = "m.id, m.conversation_id, m.sender_id, m.content, m.created_at, \
     m.edited_at, m.deleted, m.attachment_url, m.attachment_name, m.attachment_mime, \
     m.attachment_size";

fn query_directory(conn: &Connection, user_id: &str) -> Result<Vec<DirectoryRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLS},
                CASE
                    WHEN c.kind = 'direct' THEN COALESCE(
                        (SELECT pr.display_name
                         FROM participants p2
                         JOIN profiles pr ON pr.id = p2.user_id
                         WHERE p2.conversation_id = c.id
                           AND p2.user_id <> ?1
                           AND p2.left_at IS NULL
                         LIMIT 1),
                        'Direct message')
                    ELSE COALESCE(c.name, 'Room')
                END AS display_name,
                (SELECT COUNT(*)
                 FROM messages m
                 WHERE m.conversation_id = c.id
                   AND m.deleted = 0
                   AND m.sender_id <> ?1
                   AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)) AS unread
         FROM conversations c
         JOIN participants p
           ON p.conversation_id = c.id
          AND p.user_id = ?1
          AND p.left_at IS NULL
         WHERE c.active = 1
         ORDER BY COALESCE(c.last_message_at, c.created_at) DESC"
    ))?;

    let rows = stmt
        .query_map([user_id], |row| {
            Ok(DirectoryRow {
                conversation: map_conversation(row)?,
                display_name: row.get(13)?,
                unread: row.get(14)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn map_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileRow> {
    Ok(ProfileRow {
        id: row.get(0)?,
        display_name: row.get(1)?,
        phone: row.get(2)?,
        unit_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        unit_id: row.get(3)?,
        applicable_units: row.get(4)?,
        active: row.get(5)?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
        direct_key: row.get(8)?,
        last_message_id: row.get(9)?,
        last_message_content: row.get(10)?,
        last_message_author: row.get(11)?,
        last_message_at: row.get(12)?,
    })
}

fn map_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        joined_at: row.get(3)?,
        left_at: row.get(4)?,
        last_read_at: row.get(5)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        edited_at: row.get(5)?,
        deleted: row.get(6)?,
        attachment_url: row.get(7)?,
        attachment_name: row.get(8)?,
        attachment_mime: row.get(9)?,
        attachment_size: row.get(10)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::models::format_ts;
    use crate::{Database, is_unique_violation};
    use chrono::Utc;

    fn seed_profiles(db: &Database, names: &[(&str, &str)]) {
        let now = format_ts(Utc::now());
        for (id, name) in names {
            db.upsert_profile(id, name, None, None, &now).unwrap();
        }
    }

    fn seed_direct(db: &Database, id: &str, a: &str, b: &str) {
        let now = format_ts(Utc::now());
        let key = if a < b {
            format!("{a}:{b}")
        } else {
            format!("{b}:{a}")
        };
        db.insert_conversation(id, None, "direct", None, None, a, &now, Some(&key))
            .unwrap();
        db.insert_participant(id, a, "owner", &now).unwrap();
        db.insert_participant(id, b, "member", &now).unwrap();
    }

    #[test]
    fn second_active_direct_for_pair_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        seed_profiles(&db, &[("u1", "Alice"), ("u2", "Bob")]);
        seed_direct(&db, "c1", "u1", "u2");

        let now = format_ts(Utc::now());
        let err = db
            .insert_conversation("c2", None, "direct", None, None, "u2", &now, Some("u1:u2"))
            .unwrap_err();
        assert!(is_unique_violation(&err));

        // Archiving frees the pair for re-creation.
        assert!(db.set_conversation_active("c1", false).unwrap());
        db.insert_conversation("c3", None, "direct", None, None, "u2", &now, Some("u1:u2"))
            .unwrap();
        assert_eq!(db.find_direct("u1:u2").unwrap(), Some("c3".into()));
    }

    #[test]
    fn foreign_key_failure_is_not_a_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        seed_profiles(&db, &[("u1", "Alice")]);

        let now = format_ts(Utc::now());
        db.insert_conversation("c1", None, "direct", None, None, "u1", &now, Some("ghost:u1"))
            .unwrap();
        db.insert_participant("c1", "u1", "owner", &now).unwrap();

        // No profile row for the peer
        let err = db.insert_participant("c1", "ghost", "member", &now).unwrap_err();
        assert!(!is_unique_violation(&err));

        // The pair index itself still classifies
        let err = db
            .insert_conversation("c2", None, "direct", None, None, "u1", &now, Some("ghost:u1"))
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn message_without_text_or_attachment_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        seed_profiles(&db, &[("u1", "Alice"), ("u2", "Bob")]);
        seed_direct(&db, "c1", "u1", "u2");

        let now = format_ts(Utc::now());
        let err = db
            .insert_message("m1", "c1", "u1", "", &now, None, None, None, None)
            .unwrap_err();
        assert!(err.to_string().contains("CHECK"));
        assert!(!is_unique_violation(&err));

        // Attachment-only is fine.
        db.insert_message(
            "m2",
            "c1",
            "u1",
            "",
            &now,
            Some("/blobs/x"),
            Some("scan.pdf"),
            Some("application/pdf"),
            Some(2048),
        )
        .unwrap();
    }

    #[test]
    fn window_paginates_backwards_without_overlap() {
        let db = Database::open_in_memory().unwrap();
        seed_profiles(&db, &[("u1", "Alice"), ("u2", "Bob")]);
        seed_direct(&db, "c1", "u1", "u2");

        let base = Utc::now();
        for i in 0..5 {
            let ts = format_ts(base + chrono::Duration::seconds(i));
            db.insert_message(
                &format!("m{i}"),
                "c1",
                "u1",
                &format!("msg {i}"),
                &ts,
                None,
                None,
                None,
                None,
            )
            .unwrap();
        }

        let first = db.messages_window("c1", 2, None).unwrap();
        let ids: Vec<_> = first.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m4", "m3"]);

        let oldest = first.last().unwrap();
        let second = db
            .messages_window("c1", 2, Some((&oldest.created_at, &oldest.id)))
            .unwrap();
        let ids: Vec<_> = second.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m1"]);
    }

    #[test]
    fn contacts_exclude_existing_direct_peers() {
        let db = Database::open_in_memory().unwrap();
        seed_profiles(&db, &[("u1", "Alice"), ("u2", "Bob"), ("u3", "Carol")]);
        seed_direct(&db, "c1", "u1", "u2");

        let contacts = db.list_contacts("u1").unwrap();
        let ids: Vec<_> = contacts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["u3"]);

        // Bob sees Carol but not Alice; Carol still sees both.
        let ids: Vec<_> = db
            .list_contacts("u2")
            .unwrap()
            .iter()
            .map(|p| p.id.clone())
            .collect();
        assert_eq!(ids, ["u3"]);
        assert_eq!(db.list_contacts("u3").unwrap().len(), 2);
    }

    #[test]
    fn directory_resolves_peer_names_and_unread() {
        let db = Database::open_in_memory().unwrap();
        seed_profiles(&db, &[("u1", "Alice"), ("u2", "Bob")]);
        seed_direct(&db, "c1", "u1", "u2");

        let now = format_ts(Utc::now());
        db.insert_message("m1", "c1", "u2", "ping", &now, None, None, None, None)
            .unwrap();
        db.update_last_message("c1", "m1", "ping", "u2", &now).unwrap();

        let dir = db.conversations_for_user("u1").unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir[0].display_name, "Bob");
        assert_eq!(dir[0].unread, 1);
        assert_eq!(dir[0].conversation.last_message_id.as_deref(), Some("m1"));

        // Own messages never count as unread; marking read zeroes the rest.
        let later = format_ts(Utc::now());
        assert!(db.set_last_read("c1", "u1", &later).unwrap());
        let dir = db.conversations_for_user("u1").unwrap();
        assert_eq!(dir[0].unread, 0);
    }

    #[test]
    fn leaving_hides_the_conversation() {
        let db = Database::open_in_memory().unwrap();
        seed_profiles(&db, &[("u1", "Alice"), ("u2", "Bob"), ("u3", "Carol")]);
        let now = format_ts(Utc::now());
        db.insert_conversation(
            "g1",
            Some("Night shift"),
            "group",
            None,
            None,
            "u1",
            &now,
            None,
        )
        .unwrap();
        for user in ["u1", "u2", "u3"] {
            db.insert_participant("g1", user, "member", &now).unwrap();
        }

        assert!(db.set_left("g1", "u3", &now).unwrap());
        assert!(db.conversations_for_user("u3").unwrap().is_empty());
        assert_eq!(db.participants_of("g1").unwrap().len(), 2);

        // Re-attach clears left_at.
        db.insert_participant("g1", "u3", "member", &now).unwrap();
        assert_eq!(db.conversations_for_user("u3").unwrap().len(), 1);
    }
}
