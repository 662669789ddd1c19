use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Users are identified by the integer id issued by the marketplace account service.
pub type UserId = i64;

/// Delivery state of a persisted message. Stored as an integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
}

impl MessageStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Sent),
            1 => Some(Self::Delivered),
            _ => None,
        }
    }
}

/// What the message body carries. Clients render `image` bodies as a media
/// URL and `listing` bodies as a vehicle listing id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Listing,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Listing => "listing",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "listing" => Ok(Self::Listing),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A 1:1 conversation. `user_a < user_b` regardless of who wrote first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    #[serde(rename = "user_id_1")]
    pub user_a: UserId,
    #[serde(rename = "user_id_2")]
    pub user_b: UserId,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn counterpart_of(&self, user_id: UserId) -> UserId {
        if self.user_a == user_id { self.user_b } else { self.user_a }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: UserId,
    pub status: MessageStatus,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    pub online: bool,
    pub last_active_at: DateTime<Utc>,
}

/// One row of a user's inbox, as rendered by the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub counterpart_id: UserId,
    pub counterpart_name: String,
    pub counterpart_online: bool,
    pub counterpart_last_active_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub undelivered: i64,
    pub updated_at: DateTime<Utc>,
}

/// Payload handed to the push provider for an offline recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
}

impl Notification {
    const PREVIEW_CHARS: usize = 120;

    pub fn for_message(message: &Message) -> Self {
        let body = match message.kind {
            MessageKind::Text => message.body.chars().take(Self::PREVIEW_CHARS).collect(),
            MessageKind::Image => "Sent you a photo".to_string(),
            MessageKind::Listing => "Shared a listing with you".to_string(),
        };
        Self {
            title: "New message".to_string(),
            body,
            conversation_id: Some(message.conversation_id),
            message_id: Some(message.id),
        }
    }

    pub fn for_broadcast(body: &str) -> Self {
        Self {
            title: "Announcement".to_string(),
            body: body.chars().take(Self::PREVIEW_CHARS).collect(),
            conversation_id: None,
            message_id: None,
        }
    }
}
