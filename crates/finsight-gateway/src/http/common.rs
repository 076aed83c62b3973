use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use finsight_engine::EngineError;

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
            code,
        }),
    )
}

/// Map engine errors onto HTTP statuses: missing things are 404, everything
/// else is a 500 with the engine's message.
pub fn engine_error(e: EngineError) -> ApiError {
    match &e {
        EngineError::NotFound { .. } => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string()),
        EngineError::Dialogue(finsight_dialogue::DialogueError::SessionNotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
        }
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string()),
    }
}
