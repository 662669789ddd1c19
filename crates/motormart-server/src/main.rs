use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use motormart_api::auth::{self, AppState, AppStateInner};
use motormart_gateway::config::RouterConfig;
use motormart_gateway::connection;
use motormart_gateway::push::{HttpPushGateway, LogPushGateway, PushGateway};
use motormart_gateway::registry::ConnectionRegistry;
use motormart_gateway::router::MessageRouter;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "motormart=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret = std::env::var("MOTORMART_JWT_SECRET").unwrap_or_default();
    if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
        anyhow::bail!("MOTORMART_JWT_SECRET is unset or still a placeholder; it must match the auth service");
    }
    let db_path = std::env::var("MOTORMART_DB_PATH").unwrap_or_else(|_| "motormart.db".into());
    let host = std::env::var("MOTORMART_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("MOTORMART_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let defaults = RouterConfig::default();
    let config = RouterConfig {
        db_timeout: env_millis("MOTORMART_DB_TIMEOUT_MS", defaults.db_timeout),
        write_timeout: env_millis("MOTORMART_WRITE_TIMEOUT_MS", defaults.write_timeout),
        push_timeout: env_millis("MOTORMART_PUSH_TIMEOUT_MS", defaults.push_timeout),
    };

    let push: Arc<dyn PushGateway> = match std::env::var("MOTORMART_PUSH_URL") {
        Ok(url) if !url.is_empty() => {
            info!("Push notifications via {}", url);
            Arc::new(HttpPushGateway::new(url, std::env::var("MOTORMART_PUSH_KEY").ok()))
        }
        _ => {
            warn!("MOTORMART_PUSH_URL not set, offline recipients will only be logged");
            Arc::new(LogPushGateway)
        }
    };

    // Init database
    let db = Arc::new(motormart_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let router = MessageRouter::new(db, ConnectionRegistry::new(), push, config);
    let app_state: AppState = Arc::new(AppStateInner { router, jwt_secret });

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(app_state.clone());

    let app = Router::new()
        .merge(motormart_api::routes(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("motormart chat listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// Browsers cannot set headers on a websocket upgrade, so the token may also
/// arrive as `?token=`.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer
        .map(|TypedHeader(auth)| auth.token().to_string())
        .or(query.token);

    let Some(claims) = token.and_then(|t| auth::decode_token(&state.jwt_secret, &t)) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let router = state.router.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, router, claims.sub))
}
