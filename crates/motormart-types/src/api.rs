use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageKind, UserId};

// -- JWT Claims --

/// Claims issued by the marketplace auth service. Shared by the REST
/// middleware and the websocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    #[serde(default)]
    pub role: String,
    pub exp: usize,
}

pub const ADMIN_ROLE: &str = "admin";

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub recipient_id: UserId,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    #[serde(flatten)]
    pub message: Message,
    pub delivered_live: bool,
}

// -- Devices --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceTokenRequest {
    pub token: String,
}

// -- Admin --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BroadcastRequest {
    pub role: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub recipients: usize,
    pub live: usize,
    pub pushed: usize,
}
