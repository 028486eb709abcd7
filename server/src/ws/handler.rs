use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::session;

/// Query parameters for WebSocket connection.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub username: Option<String>,
}

/// GET /ws?username=NAME
/// Upgrades the connection and hands it to a new session. A missing or blank
/// name falls back to the configured default.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let username = resolve_username(params.username.as_deref(), &state.default_username);
    tracing::debug!(username = %username, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| {
        session::run_connection(socket, state.hub, username, state.session)
    })
}

pub fn resolve_username(requested: Option<&str>, fallback: &str) -> String {
    match requested.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => fallback.to_string(),
    }
}
