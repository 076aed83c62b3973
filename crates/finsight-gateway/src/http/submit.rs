//! POST /submit — the single intake endpoint.
//!
//! Request:  `{"user_id": "...", "text": "...", "session_id": "..."?}`
//! Response: `{"session_id", "message_id", "status", "reply"?}` where
//! `status` is `accepted`, `reused`, or `clarification_needed`. Clients
//! correlate the message id with events on GET /stream.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use finsight_engine::SubmitOutcome;

use crate::app::AppState;
use crate::http::common::{engine_error, error_response, ApiError};

#[derive(Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
    pub text: String,
}

pub async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitOutcome>, ApiError> {
    if req.text.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "text cannot be empty",
        ));
    }
    if req.user_id.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "user_id cannot be empty",
        ));
    }

    match state
        .orch
        .submit(req.session_id.as_deref(), &req.user_id, &req.text)
        .await
    {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            warn!(error = %e, "POST /submit failed");
            Err(engine_error(e))
        }
    }
}
