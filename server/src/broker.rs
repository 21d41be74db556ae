//! Listens on a single TCP port serving both HTTP (static assets,
//! health) and WebSocket upgrades, built on `axum`'s `Router`,
//! `AppState`, `WebSocketUpgrade`, and `ServeDir` around the binary
//! framed protocol's auth + control sub-protocol.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use ccr_core::config::Config;
use ccr_core::rate_limiter::RateLimiter;
use ccr_core::session_manager::SessionManager;
use tokio::sync::broadcast;
use tower_http::services::ServeDir;

use crate::connection;

/// Shared app state: session registry, rate limiter, config, and a
/// change-notification channel so every authenticated socket can
/// refresh its `SESSION_LIST` after a create/destroy.
#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
    pub session_list_tx: broadcast::Sender<()>,
}

#[derive(serde::Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Builds the axum router: `/ws` upgrades, `/api/health`, and optional
/// static asset serving for a browser front end (out of scope to build
/// here, but the serving surface is kept).
pub fn build_router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/api/health", get(health_handler))
        .route("/ws", get(ws_handler));

    if let Some(dir) = static_dir.filter(|d| d.exists()) {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.session_manager.len(),
    }))
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_token(&headers).or(query.token);
    ws.on_upgrade(move |socket| async move {
        connection::handle_socket(socket, peer, state, token).await;
    })
}

/// Extracts `Authorization: Bearer <token>` if present. Three
/// independent credential paths (header / query / first-frame) are
/// offered because both headless CLIs and browsers must be
/// supportable — browsers cannot set arbitrary headers on a WebSocket
/// upgrade.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}
