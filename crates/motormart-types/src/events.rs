use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Message, MessageKind, UserId};

/// Server -> client event names.
pub mod names {
    pub const READY: &str = "ready";
    pub const NEW_MESSAGE: &str = "new_message";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const BROADCAST: &str = "broadcast";
    pub const ERROR: &str = "error";
}

/// Every websocket text frame, in both directions, has this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            message: None,
            data: Some(data),
        }
    }

    pub fn ready(user_id: UserId) -> Self {
        Self::new(names::READY, serde_json::json!({ "user_id": user_id }))
    }

    /// A message addressed to the receiving user, either live or from the backlog.
    pub fn new_message(message: &Message) -> Self {
        Self::new(names::NEW_MESSAGE, to_value(message))
    }

    /// Acknowledges to the sender that the message was persisted.
    pub fn message_sent(message: &Message) -> Self {
        Self::new(names::MESSAGE_SENT, to_value(message))
    }

    pub fn broadcast(sender_id: UserId, body: &str, kind: MessageKind) -> Self {
        Self {
            event: names::BROADCAST.to_string(),
            message: Some(body.to_string()),
            data: Some(serde_json::json!({ "sender_id": sender_id, "type": kind })),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: names::ERROR.to_string(),
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn to_json(&self) -> String {
        // A Frame is strings plus an already-built Value; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

fn to_value(message: &Message) -> Value {
    serde_json::to_value(message).unwrap_or(Value::Null)
}

/// Commands sent FROM client TO server, decoded from a [`Frame`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    SendMessage {
        recipient_id: UserId,
        message: String,
        #[serde(rename = "type", default)]
        kind: MessageKind,
    },
}
