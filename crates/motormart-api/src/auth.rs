use std::sync::Arc;

use axum::http::StatusCode;
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::error;

use motormart_gateway::error::ChatError;
use motormart_gateway::router::MessageRouter;
use motormart_types::api::Claims;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub router: MessageRouter,
    pub jwt_secret: String,
}

/// Validates a token issued by the marketplace auth service.
pub fn decode_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

/// Maps a router/store failure to the HTTP status the client sees.
pub fn chat_status(e: ChatError) -> StatusCode {
    match e {
        ChatError::SelfMessage | ChatError::EmptyMessage | ChatError::TooLong(_) => {
            StatusCode::BAD_REQUEST
        }
        ChatError::Timeout(_) => {
            error!("store timeout: {}", e);
            StatusCode::GATEWAY_TIMEOUT
        }
        ChatError::Store(_) | ChatError::Join(_) => {
            error!("store failure: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
