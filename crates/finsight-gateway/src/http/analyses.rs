//! GET /analysis/{id} — one analysis record.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use finsight_core::types::Analysis;

use crate::app::AppState;
use crate::http::common::{error_response, ApiError};

pub async fn analysis_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Analysis>, ApiError> {
    state
        .orch
        .store
        .get_analysis(&id)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", e.to_string()))?
        .map(Json)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("analysis not found: {id}")))
}
