//! GET /session/{id} — session metadata plus the most recent messages.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use finsight_core::types::{ChatMessage, ChatSession};

use crate::app::AppState;
use crate::http::common::{error_response, ApiError};

/// Messages returned per session read.
const MESSAGE_WINDOW: usize = 50;

#[derive(Serialize)]
pub struct SessionResponse {
    pub session: ChatSession,
    pub messages: Vec<ChatMessage>,
}

pub async fn session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .orch
        .store
        .get_session(&id)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", e.to_string()))?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("session not found: {id}")))?;

    let messages = state
        .orch
        .store
        .list_session_messages(&id, MESSAGE_WINDOW)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", e.to_string()))?;

    Ok(Json(SessionResponse { session, messages }))
}
