use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use finsight_engine::Orchestrator;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub orch: Arc<Orchestrator>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/submit", post(crate::http::submit::submit_handler))
        .route("/stream", get(crate::http::stream::stream_handler))
        .route("/session/{id}", get(crate::http::sessions::session_handler))
        .route("/analysis/{id}", get(crate::http::analyses::analysis_handler))
        .route(
            "/admin/requeue/{job_id}",
            post(crate::http::admin::requeue_handler),
        )
        .route("/admin/jobs", get(crate::http::admin::jobs_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
