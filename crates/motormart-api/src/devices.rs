use axum::{Extension, Json, extract::State, http::StatusCode};

use motormart_types::api::{Claims, DeviceTokenRequest};

use crate::auth::{AppState, chat_status};

/// PUT /devices/token: registers the caller's push token (one per user).
pub async fn set_device_token(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<DeviceTokenRequest>,
) -> Result<StatusCode, StatusCode> {
    let token = req.token.trim().to_string();
    if token.is_empty() || token.len() > 4096 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let user_id = claims.sub;
    state
        .router
        .run_db(move |db| db.set_device_token(user_id, &token))
        .await
        .map_err(chat_status)?;
    Ok(StatusCode::NO_CONTENT)
}
