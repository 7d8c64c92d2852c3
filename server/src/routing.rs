//! HTTP routing configuration

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::channel;
use crate::error::HandshakeError;
use crate::websocket::{authorization_header, ServerState};

/// Create the application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);

    let mut router = Router::new()
        .route("/ws", get(crate::websocket::handle_websocket))
        .route("/messages", get(conversation_history))
        .route("/health", get(health_check))
        .route("/info", get(server_info));

    // Only mount admin endpoint if a token is configured
    if state.config.admin_token.is_some() {
        router = router.route("/admin/stats", get(admin_stats));
    }

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Build CORS layer from config. Permissive when no origins are configured.
fn build_cors_layer(origins: &Option<String>) -> CorsLayer {
    match origins {
        Some(list) if !list.is_empty() => {
            let parsed: Vec<_> = list
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
        }
        _ => CorsLayer::permissive(),
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn server_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "LMS Chat",
        "protocol_version": lms_chat_shared::PROTOCOL_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    username: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    id: i64,
    sender: String,
    receiver: String,
    content: String,
    sent_at: i64,
}

/// Conversation between the caller and `username`, oldest first.
///
/// Messages sent while the receiver had no live connection are read back
/// from here.
async fn conversation_history(
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryEntry>>, StatusCode> {
    let participants = channel::authenticate(
        &state.chat,
        params.username.as_deref(),
        authorization_header(&headers),
    )
    .await
    .map_err(|e| {
        warn!("History request refused: {}", e);
        match e {
            HandshakeError::MissingUsername => StatusCode::BAD_REQUEST,
            HandshakeError::UnknownPeer(_) => StatusCode::NOT_FOUND,
            HandshakeError::UnknownSubject(_) => StatusCode::UNAUTHORIZED,
            other => other.status(),
        }
    })?;

    let max = state.config.history_limit.max(1);
    let limit = params.limit.unwrap_or(max).clamp(1, max);

    let subject = &participants.subject;
    let peer = &participants.peer;
    let messages = state
        .chat
        .store
        .conversation(subject.id, peer.id, limit)
        .await
        .map_err(|e| {
            error!("History lookup failed: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let username_of = |id: i64| {
        if id == subject.id {
            subject.username.clone()
        } else {
            peer.username.clone()
        }
    };

    Ok(Json(
        messages
            .into_iter()
            .map(|m| HistoryEntry {
                id: m.id,
                sender: username_of(m.sender_id),
                receiver: username_of(m.receiver_id),
                content: m.content,
                sent_at: m.sent_at,
            })
            .collect(),
    ))
}

/// Admin stats, gated on the configured bearer token
async fn admin_stats(
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let expected = state.config.admin_token.as_deref().ok_or(StatusCode::NOT_FOUND)?;

    let provided = authorization_header(&headers)
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Constant-time comparison to prevent timing attacks
    use subtle::ConstantTimeEq;
    if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
        Ok(Json(serde_json::json!({
            "connections": state.connection_count(),
            "active_groups": state.chat.fabric.group_count(),
            "client_ips": state.tracked_ips(),
            "max_connections": state.config.max_connections,
        })))
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
