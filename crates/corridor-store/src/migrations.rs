use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Store: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            -- Staff directory data. Unit ids reference the org structure
            -- owned by the rest of the helpdesk suite; here they are opaque.
            CREATE TABLE profiles (
                id           TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                phone        TEXT,
                unit_id      TEXT,
                created_at   TEXT NOT NULL
            );

            CREATE TABLE conversations (
                id                   TEXT PRIMARY KEY,
                name                 TEXT,
                kind                 TEXT NOT NULL
                    CHECK (kind IN ('direct', 'unit', 'group')),
                unit_id              TEXT,
                applicable_units     TEXT,
                active               INTEGER NOT NULL DEFAULT 1,
                created_by           TEXT NOT NULL REFERENCES profiles(id),
                created_at           TEXT NOT NULL,
                direct_key           TEXT,
                last_message_id      TEXT,
                last_message_content TEXT,
                last_message_author  TEXT,
                last_message_at      TEXT
            );

            -- At most one ACTIVE direct conversation per unordered user
            -- pair. Archiving a chat frees the pair.
            CREATE UNIQUE INDEX idx_conversations_direct_pair
                ON conversations(direct_key)
                WHERE direct_key IS NOT NULL AND active = 1;

            CREATE INDEX idx_conversations_activity
                ON conversations(active, last_message_at);

            CREATE TABLE participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                user_id         TEXT NOT NULL REFERENCES profiles(id),
                role            TEXT NOT NULL DEFAULT 'member'
                    CHECK (role IN ('owner', 'member')),
                joined_at       TEXT NOT NULL,
                left_at         TEXT,
                last_read_at    TEXT,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user ON participants(user_id);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id       TEXT NOT NULL REFERENCES profiles(id),
                content         TEXT NOT NULL DEFAULT '',
                created_at      TEXT NOT NULL,
                edited_at       TEXT,
                deleted         INTEGER NOT NULL DEFAULT 0,
                attachment_url  TEXT,
                attachment_name TEXT,
                attachment_mime TEXT,
                attachment_size INTEGER,
                -- text, attachment, or both -- never neither
                CHECK (content <> '' OR attachment_url IS NOT NULL)
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
