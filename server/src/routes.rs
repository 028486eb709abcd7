use axum::{
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;
use crate::ws::handler as ws_handler;
use crate::ws::MemberInfo;

/// Response for GET /api/users.
#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub users: Vec<String>,
    #[serde(rename = "usersDetailed")]
    pub users_detailed: Vec<MemberInfo>,
    pub count: usize,
}

/// Response for GET /api/stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub uptime: String,
    pub uptime_secs: i64,
    pub server_time: String,
}

/// Build the axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(status_page))
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/api/users", get(list_users))
        .route("/api/stats", get(server_stats))
        .layer(cors)
        .with_state(state)
}

/// GET /: plain-text server status.
async fn status_page(State(state): State<AppState>) -> impl IntoResponse {
    let count = match state.hub.member_count().await {
        Ok(count) => count.to_string(),
        Err(_) => "unavailable".to_string(),
    };
    let body = format!(
        "relay-server is running\n\
         Active connections: {}\n\
         Connect to /ws?username=YourName to join the chat\n",
        count
    );
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        body,
    )
}

/// GET /healthz
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /api/users: current members, answered by the Hub itself.
async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<UsersResponse>, (StatusCode, String)> {
    let members = state
        .hub
        .members()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(Json(UsersResponse {
        users: members.iter().map(|m| m.username.clone()).collect(),
        count: members.len(),
        users_detailed: members,
    }))
}

/// GET /api/stats
async fn server_stats(
    State(state): State<AppState>,
) -> Result<Json<StatsResponse>, (StatusCode, String)> {
    let active_connections = state
        .hub
        .member_count()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    let now = Utc::now();
    let uptime = (now - state.started_at).max(chrono::TimeDelta::zero());

    Ok(Json(StatsResponse {
        active_connections,
        uptime: format_uptime(uptime.num_seconds()),
        uptime_secs: uptime.num_seconds(),
        server_time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

/// Render whole seconds as e.g. `1h2m3s`.
fn format_uptime(total_secs: i64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
