use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::warn;

use motormart_types::api::{BroadcastRequest, Claims};

use crate::auth::{AppState, chat_status};

/// POST /admin/broadcast: announcement to every user holding `role`.
pub async fn broadcast(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<BroadcastRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if !claims.is_admin() {
        warn!("user {} attempted an admin broadcast", claims.sub);
        return Err(StatusCode::FORBIDDEN);
    }

    let report = state
        .router
        .broadcast_to_role(claims.sub, &req.role, &req.message, req.kind)
        .await
        .map_err(chat_status)?;
    Ok(Json(report))
}
