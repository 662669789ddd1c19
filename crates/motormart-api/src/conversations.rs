use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use motormart_types::api::Claims;
use motormart_types::models::UserId;

use crate::auth::{AppState, chat_status};

/// GET /conversations: the caller's inbox, most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = claims.sub;
    let summaries = state
        .router
        .run_db(move |db| db.list_conversations(user_id))
        .await
        .map_err(chat_status)?;
    Ok(Json(summaries))
}

/// GET /presence/{user_id}
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let presence = state
        .router
        .run_db(move |db| db.get_presence(user_id))
        .await
        .map_err(chat_status)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(presence))
}
