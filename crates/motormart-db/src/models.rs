//! Row mappers. SQL column order is fixed by the `*_COLUMNS` constants so
//! every query that selects a message maps it the same way.

use rusqlite::Row;
use rusqlite::types::Type;

use motormart_types::models::{Message, MessageKind, MessageStatus};

pub(crate) const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, status, message, type, created_at";

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let status: i64 = row.get(3)?;
    let status = MessageStatus::from_i64(status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Integer,
            format!("invalid message status {status}").into(),
        )
    })?;

    let kind: String = row.get(5)?;
    let kind = kind
        .parse::<MessageKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        status,
        body: row.get(4)?,
        kind,
        created_at: row.get(6)?,
    })
}
