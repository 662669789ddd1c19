use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY,
            display_name    TEXT NOT NULL,
            role            TEXT NOT NULL DEFAULT 'user'
        );

        CREATE INDEX IF NOT EXISTS idx_users_role ON users(role);

        CREATE TABLE IF NOT EXISTS presence (
            user_id         INTEGER PRIMARY KEY,
            online          INTEGER NOT NULL DEFAULT 0,
            last_active_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS device_tokens (
            user_id         INTEGER PRIMARY KEY,
            token           TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id_1       INTEGER NOT NULL,
            user_id_2       INTEGER NOT NULL,
            updated_at      TEXT NOT NULL,
            UNIQUE(user_id_1, user_id_2),
            CHECK(user_id_1 < user_id_2)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user2
            ON conversations(user_id_2);

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            sender_id       INTEGER NOT NULL,
            status          INTEGER NOT NULL DEFAULT 0 CHECK(status IN (0, 1)),
            message         TEXT NOT NULL,
            type            TEXT NOT NULL DEFAULT 'text',
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, id);

        CREATE INDEX IF NOT EXISTS idx_messages_pending
            ON messages(conversation_id) WHERE status = 0;

        -- Delivery status only moves forward: Sent (0) -> Delivered (1)
        CREATE TRIGGER IF NOT EXISTS messages_status_forward_only
            BEFORE UPDATE OF status ON messages
            WHEN NEW.status < OLD.status
        BEGIN
            SELECT RAISE(ABORT, 'message status cannot move backwards');
        END;
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
