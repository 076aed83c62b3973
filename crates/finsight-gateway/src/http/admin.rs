//! Operator endpoints: requeue a terminal job, inspect a queue.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use finsight_core::types::{Job, JobStatus, QueueName};

use crate::app::AppState;
use crate::http::common::{error_response, ApiError};

#[derive(Serialize)]
pub struct RequeueResponse {
    pub job_id: String,
    pub requeued: bool,
}

/// POST /admin/requeue/{job_id} — reset a terminal job to `queued`.
/// Jobs that are still queued or running are left alone (409).
pub async fn requeue_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<RequeueResponse>, ApiError> {
    let job = state
        .orch
        .store
        .get_job(&job_id)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", e.to_string()))?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("job not found: {job_id}")))?;

    if !job.status.is_terminal() {
        return Err(error_response(
            StatusCode::CONFLICT,
            "NOT_TERMINAL",
            format!("job {job_id} is {}, not terminal", job.status),
        ));
    }

    let requeued = state
        .orch
        .store
        .requeue_terminal(&job_id)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", e.to_string()))?;
    info!(%job_id, requeued, "admin requeue");

    Ok(Json(RequeueResponse { job_id, requeued }))
}

#[derive(Deserialize)]
pub struct JobsQuery {
    pub queue: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<Job>,
}

/// GET /admin/jobs?queue=analysis&status=failed — queue inspection.
pub async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let queue = QueueName::from_str(&q.queue)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", e))?;
    let status = q
        .status
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", e))?;

    let jobs = state
        .orch
        .store
        .list_jobs(queue, status, q.limit)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", e.to_string()))?;

    Ok(Json(JobsResponse { jobs }))
}
