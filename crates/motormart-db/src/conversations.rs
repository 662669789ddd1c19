use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use motormart_types::models::{
    Conversation, ConversationSummary, Message, MessageKind, MessageStatus, UserId,
};

use crate::Database;
use crate::models::{MESSAGE_COLUMNS, message_from_row};

/// Orders an unordered pair of users the way the `conversations` table stores it.
pub fn canonical_pair(x: UserId, y: UserId) -> Result<(UserId, UserId)> {
    if x == y {
        bail!("a conversation needs two distinct users, got {} twice", x);
    }
    Ok((x.min(y), x.max(y)))
}

impl Database {
    // -- Conversations --

    /// Atomic get-or-insert of the canonical conversation for `(x, y)`.
    /// The unique constraint on `(user_id_1, user_id_2)` resolves concurrent
    /// first contact to a single row.
    pub fn upsert_conversation(&self, x: UserId, y: UserId) -> Result<i64> {
        let (a, b) = canonical_pair(x, y)?;
        self.with_conn(|conn| upsert_conversation_in(conn, a, b, Utc::now()))
    }

    pub fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, user_id_1, user_id_2, updated_at FROM conversations WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(Conversation {
                            id: row.get(0)?,
                            user_a: row.get(1)?,
                            user_b: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Inbox for `user_id`, most recently updated first.
    pub fn list_conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.counterpart, u.display_name, p.online, p.last_active_at,
                        (SELECT m.message FROM messages m
                          WHERE m.conversation_id = c.id
                          ORDER BY m.id DESC LIMIT 1),
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id
                            AND m.sender_id != ?1
                            AND m.status = 0),
                        c.updated_at
                 FROM (SELECT id, updated_at,
                              CASE WHEN user_id_1 = ?1 THEN user_id_2 ELSE user_id_1 END AS counterpart
                         FROM conversations
                        WHERE user_id_1 = ?1 OR user_id_2 = ?1) c
                 LEFT JOIN users u ON u.id = c.counterpart
                 LEFT JOIN presence p ON p.user_id = c.counterpart
                 ORDER BY c.updated_at DESC, c.id DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationSummary {
                        id: row.get(0)?,
                        counterpart_id: row.get(1)?,
                        counterpart_name: row
                            .get::<_, Option<String>>(2)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        counterpart_online: row.get::<_, Option<bool>>(3)?.unwrap_or(false),
                        counterpart_last_active_at: row.get(4)?,
                        last_message: row.get(5)?,
                        undelivered: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Messages --

    /// Inserts a `Sent` message and bumps the conversation's `updated_at` in
    /// one transaction. Fails if `sender_id` is not a participant.
    pub fn append_message(
        &self,
        conversation_id: i64,
        sender_id: UserId,
        body: &str,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = append_message_in(&tx, conversation_id, sender_id, body, kind, created_at)?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// Upserts the canonical conversation and appends the message in a single
    /// transaction: either both exist afterwards or neither does.
    pub fn persist_message(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        body: &str,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        self.persist_message_if(|| true, sender_id, recipient_id, body, kind, created_at)?
            .ok_or_else(|| anyhow!("persist was declined"))
    }

    /// Like [`Database::persist_message`], but `proceed` is asked once the
    /// connection is held and before the transaction begins. When it says no
    /// nothing is written and `None` comes back.
    pub fn persist_message_if(
        &self,
        proceed: impl FnOnce() -> bool,
        sender_id: UserId,
        recipient_id: UserId,
        body: &str,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let (a, b) = canonical_pair(sender_id, recipient_id)?;
        self.with_conn_mut(|conn| {
            if !proceed() {
                return Ok(None);
            }
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let conversation_id = upsert_conversation_in(&tx, a, b, created_at)?;
            let id = append_message_in(&tx, conversation_id, sender_id, body, kind, created_at)?;
            tx.commit()?;

            Ok(Some(Message {
                id,
                conversation_id,
                sender_id,
                status: MessageStatus::Sent,
                body: body.to_string(),
                kind,
                created_at,
            }))
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
            Ok(conn.query_row(&sql, [id], message_from_row).optional()?)
        })
    }

    /// Keyset page: the `limit` most recent messages with `id < before_id`,
    /// returned in ascending `id` order.
    pub fn get_messages(&self, conversation_id: i64, before_id: i64, limit: u32) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND id < ?2
                 ORDER BY id DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(params![conversation_id, before_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    /// Targeted `Sent -> Delivered` transition after a successful live write.
    /// Returns false when the message was already delivered (or does not exist).
    pub fn mark_delivered(&self, message_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1 AND status = ?3",
                params![
                    message_id,
                    MessageStatus::Delivered.as_i64(),
                    MessageStatus::Sent.as_i64()
                ],
            )?;
            Ok(changed == 1)
        })
    }

    /// Flips every `Sent` message addressed to `user_id`, across all of their
    /// conversations, to `Delivered` and returns exactly the flipped rows in
    /// ascending `id` order. A second call finds nothing left to flip.
    pub fn mark_delivered_for_recipient(&self, user_id: UserId) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "UPDATE messages SET status = ?2
                 WHERE status = ?3
                   AND sender_id != ?1
                   AND conversation_id IN (
                       SELECT id FROM conversations WHERE user_id_1 = ?1 OR user_id_2 = ?1
                   )
                 RETURNING {MESSAGE_COLUMNS}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(
                    params![
                        user_id,
                        MessageStatus::Delivered.as_i64(),
                        MessageStatus::Sent.as_i64()
                    ],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            // RETURNING order is unspecified
            rows.sort_by_key(|m| m.id);
            Ok(rows)
        })
    }
}

fn upsert_conversation_in(
    conn: &Connection,
    user_a: UserId,
    user_b: UserId,
    now: DateTime<Utc>,
) -> Result<i64> {
    // The no-op DO UPDATE makes RETURNING yield the existing row's id on conflict.
    let id = conn.query_row(
        "INSERT INTO conversations (user_id_1, user_id_2, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id_1, user_id_2) DO UPDATE SET user_id_1 = excluded.user_id_1
         RETURNING id",
        params![user_a, user_b, now],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn append_message_in(
    conn: &Connection,
    conversation_id: i64,
    sender_id: UserId,
    body: &str,
    kind: MessageKind,
    created_at: DateTime<Utc>,
) -> Result<i64> {
    let touched = conn.execute(
        "UPDATE conversations SET updated_at = ?3
         WHERE id = ?1 AND (user_id_1 = ?2 OR user_id_2 = ?2)",
        params![conversation_id, sender_id, created_at],
    )?;
    if touched == 0 {
        return Err(anyhow!(
            "user {} is not a participant of conversation {}",
            sender_id,
            conversation_id
        ));
    }

    conn.execute(
        "INSERT INTO messages (conversation_id, sender_id, status, message, type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            conversation_id,
            sender_id,
            MessageStatus::Sent.as_i64(),
            body,
            kind.as_str(),
            created_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn send(db: &Database, from: UserId, to: UserId, body: &str) -> Message {
        db.persist_message(from, to, body, MessageKind::Text, Utc::now()).unwrap()
    }

    #[test]
    fn upsert_is_symmetric() {
        let db = db();
        let ab = db.upsert_conversation(3, 8).unwrap();
        let ba = db.upsert_conversation(8, 3).unwrap();
        assert_eq!(ab, ba);

        let conv = db.get_conversation(ab).unwrap().unwrap();
        assert_eq!((conv.user_a, conv.user_b), (3, 8));
    }

    #[test]
    fn self_conversation_is_rejected() {
        let db = db();
        assert!(db.upsert_conversation(5, 5).is_err());
        assert!(db.persist_message(5, 5, "hi", MessageKind::Text, Utc::now()).is_err());
    }

    #[test]
    fn concurrent_first_contact_creates_one_conversation() {
        let db = Arc::new(db());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        db.upsert_conversation(1, 2).unwrap()
                    } else {
                        db.upsert_conversation(2, 1).unwrap()
                    }
                })
            })
            .collect();

        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));

        let rows: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn declined_persist_writes_nothing() {
        let db = db();
        let declined = db
            .persist_message_if(|| false, 1, 2, "hi", MessageKind::Text, Utc::now())
            .unwrap();
        assert!(declined.is_none());
        assert!(db.list_conversations(1).unwrap().is_empty());

        let accepted = db
            .persist_message_if(|| true, 1, 2, "hi", MessageKind::Text, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(db.get_message(accepted.id).unwrap().unwrap().body, "hi");
    }

    #[test]
    fn append_bumps_updated_at() {
        let db = db();
        let id = db.upsert_conversation(1, 2).unwrap();
        let before = db.get_conversation(id).unwrap().unwrap().updated_at;

        let later = before + chrono::Duration::seconds(30);
        db.append_message(id, 2, "hello", MessageKind::Text, later).unwrap();

        let after = db.get_conversation(id).unwrap().unwrap().updated_at;
        assert_eq!(after, later);
    }

    #[test]
    fn append_rejects_non_participant_and_leaves_nothing_behind() {
        let db = db();
        let id = db.upsert_conversation(1, 2).unwrap();
        assert!(db.append_message(id, 9, "intruder", MessageKind::Text, Utc::now()).is_err());
        assert!(db.get_messages(id, i64::MAX, 50).unwrap().is_empty());
    }

    #[test]
    fn first_message_creates_canonical_conversation_as_sent() {
        let db = db();
        let msg = send(&db, 1, 2, "hi");

        let conv = db.get_conversation(msg.conversation_id).unwrap().unwrap();
        assert_eq!((conv.user_a, conv.user_b), (1, 2));
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(db.get_message(msg.id).unwrap().unwrap(), msg);
    }

    #[test]
    fn messages_keep_insertion_order_across_senders() {
        let db = db();
        let mut expected = Vec::new();
        for i in 0..10 {
            let (from, to) = if i % 3 == 0 { (2, 1) } else { (1, 2) };
            expected.push(send(&db, from, to, &format!("m{i}")).id);
        }

        let conv = db.upsert_conversation(1, 2).unwrap();
        let got: Vec<i64> = db
            .get_messages(conv, i64::MAX, 100)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(got, expected);
        assert!(got.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn keyset_page_returns_most_recent_before_cursor_ascending() {
        let db = db();
        let ids: Vec<i64> = (0..50).map(|i| send(&db, 1, 2, &format!("m{i}")).id).collect();
        let conv = db.upsert_conversation(1, 2).unwrap();

        let page = db.get_messages(conv, 1000, 20).unwrap();
        let got: Vec<i64> = page.iter().map(|m| m.id).collect();
        assert_eq!(got, ids[30..].to_vec());

        let older = db.get_messages(conv, got[0], 20).unwrap();
        let older: Vec<i64> = older.iter().map(|m| m.id).collect();
        assert_eq!(older, ids[10..30].to_vec());
    }

    #[test]
    fn keyset_page_is_scoped_to_conversation() {
        let db = db();
        send(&db, 1, 2, "a");
        let other = send(&db, 1, 3, "b");
        let page = db.get_messages(other.conversation_id, i64::MAX, 20).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].body, "b");
    }

    #[test]
    fn mark_delivered_is_one_way() {
        let db = db();
        let msg = send(&db, 1, 2, "hi");
        assert!(db.mark_delivered(msg.id).unwrap());
        assert!(!db.mark_delivered(msg.id).unwrap());
        assert_eq!(db.get_message(msg.id).unwrap().unwrap().status, MessageStatus::Delivered);
    }

    #[test]
    fn status_cannot_regress() {
        let db = db();
        let msg = send(&db, 1, 2, "hi");
        db.mark_delivered(msg.id).unwrap();
        let res = db.with_conn(|conn| {
            conn.execute("UPDATE messages SET status = 0 WHERE id = ?1", [msg.id])?;
            Ok(())
        });
        assert!(res.is_err());
    }

    #[test]
    fn reconciliation_flips_only_inbound_and_is_idempotent() {
        let db = db();
        let a = send(&db, 1, 2, "hi");
        let b = send(&db, 3, 2, "is the car still available?");
        send(&db, 2, 1, "outbound from 2");
        send(&db, 1, 3, "unrelated");

        let flipped = db.mark_delivered_for_recipient(2).unwrap();
        let ids: Vec<i64> = flipped.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(flipped.iter().all(|m| m.status == MessageStatus::Delivered));

        assert!(db.mark_delivered_for_recipient(2).unwrap().is_empty());
        assert_eq!(db.get_message(a.id).unwrap().unwrap().status, MessageStatus::Delivered);
    }

    #[test]
    fn reconciliation_skips_already_delivered() {
        let db = db();
        let live = send(&db, 1, 2, "live");
        let queued = send(&db, 1, 2, "queued");
        db.mark_delivered(live.id).unwrap();

        let flipped = db.mark_delivered_for_recipient(2).unwrap();
        assert_eq!(flipped.len(), 1);
        assert_eq!(flipped[0].id, queued.id);
    }

    #[test]
    fn inbox_is_most_recent_first_with_counterpart() {
        let db = db();
        db.upsert_user(2, "Dealer Dan", "user").unwrap();
        db.set_online(2).unwrap();

        let t0 = Utc::now();
        db.persist_message(1, 2, "old", MessageKind::Text, t0).unwrap();
        db.persist_message(3, 1, "newer", MessageKind::Text, t0 + chrono::Duration::seconds(5))
            .unwrap();
        db.persist_message(2, 1, "pending", MessageKind::Text, t0 + chrono::Duration::seconds(1))
            .unwrap();

        let inbox = db.list_conversations(1).unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].counterpart_id, 3);
        assert_eq!(inbox[0].counterpart_name, "unknown");
        assert!(!inbox[0].counterpart_online);

        assert_eq!(inbox[1].counterpart_id, 2);
        assert_eq!(inbox[1].counterpart_name, "Dealer Dan");
        assert!(inbox[1].counterpart_online);
        assert_eq!(inbox[1].last_message.as_deref(), Some("pending"));
        assert_eq!(inbox[1].undelivered, 1);
    }
}
