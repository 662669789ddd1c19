pub mod admin;
pub mod auth;
pub mod conversations;
pub mod devices;
pub mod messages;
pub mod middleware;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

use crate::auth::AppState;

/// Authenticated REST surface consumed by the marketplace apps.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/messages", get(messages::get_messages))
        .route("/messages", post(messages::send_message))
        .route("/presence/{user_id}", get(conversations::get_presence))
        .route("/devices/token", put(devices::set_device_token))
        .route("/admin/broadcast", post(admin::broadcast))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}
