use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
};
use serde::Serialize;
use serde_json::json;

use crate::websocket::SignalingState;

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub exists: bool,
    pub members: usize,
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Report whether a session currently exists and how many members it has.
/// Sessions are created lazily on first join and vanish when they empty, so
/// `exists: false` covers both never-created and emptied sessions.
pub async fn get_session_status(
    Path(session_id): Path<String>,
    State(state): State<SignalingState>,
) -> impl IntoResponse {
    let response = match state.registry.members_of(&session_id) {
        Some(members) => SessionStatusResponse {
            exists: true,
            members: members.len(),
        },
        None => SessionStatusResponse {
            exists: false,
            members: 0,
        },
    };
    Json(response)
}
