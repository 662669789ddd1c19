use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use motormart_gateway::router::Delivery;
use motormart_types::api::{Claims, SendMessageRequest, SendMessageResponse};

use crate::auth::{AppState, chat_status};

const MAX_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub conversation_id: i64,
    /// Keyset cursor: only messages with a smaller id are returned. Omit for the newest page.
    pub last_id: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

/// GET /messages: one keyset page of a conversation the caller takes part in.
pub async fn get_messages(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversation_id = query.conversation_id;
    let conversation = state
        .router
        .run_db(move |db| db.get_conversation(conversation_id))
        .await
        .map_err(chat_status)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if conversation.user_a != claims.sub && conversation.user_b != claims.sub {
        return Err(StatusCode::FORBIDDEN);
    }

    let before = query.last_id.unwrap_or(i64::MAX);
    let limit = query.limit.clamp(1, MAX_PAGE);
    let messages = state
        .router
        .run_db(move |db| db.get_messages(conversation_id, before, limit))
        .await
        .map_err(chat_status)?;

    Ok(Json(messages))
}

/// POST /messages: same path as a websocket `send_message` frame.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let routed = state
        .router
        .route(claims.sub, req.recipient_id, req.message, req.kind)
        .await
        .map_err(chat_status)?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            delivered_live: routed.delivery == Delivery::Live,
            message: routed.message,
        }),
    ))
}
