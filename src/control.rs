//! HTTP control plane for session lifecycle
//!
//! Four endpoints with compact binary bodies. Logical failures (bad session
//! info, unknown or full session) ride back as a `TokenReply` error inside
//! an HTTP 200; only an undecodable body earns a 400.

use crate::metrics::global_metrics;
use crate::registry::SessionRegistry;
use crate::relay::PendingCaches;
use crate::wire::{
    decode_join_request, encode_preview_list, SessionInfo, TokenReply,
};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};

/// Shared state behind every handler
pub struct ControlState {
    pub registry: Arc<SessionRegistry>,
    pub caches: Arc<PendingCaches>,
}

/// Build the control-plane router
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/session/list", get(list_sessions))
        .route("/session/allocate", post(allocate_session))
        .route("/session/join", post(join_session))
        .route("/session/modify", post(modify_session))
        .with_state(state)
}

/// `GET /session/list` — snapshot of every active session
async fn list_sessions(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let sessions = state.registry.sessions().await;
    let mut previews = Vec::with_capacity(sessions.len());
    for session in sessions {
        previews.push(session.to_preview().await);
    }
    trace!(count = previews.len(), "session list served");
    encode_preview_list(&previews).to_vec()
}

/// `POST /session/allocate` — deposit a create cache, hand back its token
async fn allocate_session(
    State(state): State<Arc<ControlState>>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(info) = SessionInfo::decode(&body) else {
        return (StatusCode::BAD_REQUEST, Vec::new());
    };
    if !info.is_valid() {
        debug!(name = %info.name, max = info.max_members, "allocate rejected");
        let reply = TokenReply::from_error("invalid session info");
        return (StatusCode::OK, reply.encode().to_vec());
    }
    let token = state.caches.create.add(info).await;
    global_metrics().token_issued();
    (StatusCode::OK, TokenReply::Token(token).encode().to_vec())
}

/// `POST /session/join` — validate the target session, deposit a join cache
async fn join_session(State(state): State<Arc<ControlState>>, body: Bytes) -> impl IntoResponse {
    let Some(session_id) = decode_join_request(&body) else {
        return (StatusCode::BAD_REQUEST, Vec::new());
    };
    let Some(session) = state.registry.session_by_id(session_id).await else {
        let reply = TokenReply::from_error("unknown session");
        return (StatusCode::OK, reply.encode().to_vec());
    };
    let (full, current) = session.is_full().await;
    if full {
        debug!(session = session_id, current, "join rejected, session full");
        let reply = TokenReply::from_error("session is full");
        return (StatusCode::OK, reply.encode().to_vec());
    }
    let token = state.caches.join.add(session_id).await;
    global_metrics().token_issued();
    (StatusCode::OK, TokenReply::Token(token).encode().to_vec())
}

/// `POST /session/modify` — deposit a modify cache; the host consumes it
/// over KCP
async fn modify_session(State(state): State<Arc<ControlState>>, body: Bytes) -> impl IntoResponse {
    let Some(info) = SessionInfo::decode(&body) else {
        return (StatusCode::BAD_REQUEST, Vec::new());
    };
    if !info.is_valid() {
        let reply = TokenReply::from_error("invalid session info");
        return (StatusCode::OK, reply.encode().to_vec());
    }
    let token = state.caches.modify.add(info).await;
    global_metrics().token_issued();
    (StatusCode::OK, TokenReply::Token(token).encode().to_vec())
}
