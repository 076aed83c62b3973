//! Execution worker — consumes the `execution` queue, runs the analysis
//! script in the external sandbox and writes the outcome back.
//!
//! Execution jobs are terminal on first failure: re-running a deterministic
//! script on the same inputs cannot heal anything, so the admin requeue
//! endpoint is the manual retry path.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use finsight_core::types::{
    now_rfc3339, AnalysisStatus, ChatMessage, ExecutionJobPayload, Job, MessageStatus,
    ProgressEvent, Role,
};
use finsight_queue::{HandlerError, JobHandler};
use finsight_store::gateway::{AnalysisUpdate, MessageUpdate};
use finsight_store::cache_key;

use crate::orchestrator::Orchestrator;
use crate::sandbox::SandboxError;

pub struct ExecutionHandler {
    orch: Arc<Orchestrator>,
}

impl ExecutionHandler {
    pub fn new(orch: Arc<Orchestrator>) -> Self {
        Self { orch }
    }
}

#[async_trait]
impl JobHandler for ExecutionHandler {
    async fn handle(&self, job: Job) -> std::result::Result<(), HandlerError> {
        let payload: ExecutionJobPayload = serde_json::from_value(job.payload)
            .map_err(|e| HandlerError::Fatal(format!("malformed execution payload: {e}")))?;
        self.process(payload).await
    }
}

impl ExecutionHandler {
    async fn process(&self, p: ExecutionJobPayload) -> std::result::Result<(), HandlerError> {
        let o = &self.orch;
        let started = std::time::Instant::now();

        let analysis = o
            .store
            .get_analysis(&p.analysis_id)
            .map_err(|e| HandlerError::Retry(e.to_string()))?
            .ok_or_else(|| HandlerError::Fatal(format!("analysis not found: {}", p.analysis_id)))?;

        // The winning claimant is the sole writer of the terminal state; an
        // analysis already out of `pending` was finished by someone else.
        if analysis.status != AnalysisStatus::Pending {
            return Err(HandlerError::Fatal(format!(
                "analysis {} already executed (status: {})",
                analysis.id, analysis.status
            )));
        }

        // Prefer the script store copy; fall back to the embedded text.
        let script = match analysis.script_name.as_deref() {
            Some(name) if !name.is_empty() => match o.scripts.read_script(name) {
                Ok(s) => s,
                Err(e) => {
                    warn!(script = name, "script store read failed, using embedded copy: {e}");
                    analysis.generated_script.clone()
                }
            },
            _ => analysis.generated_script.clone(),
        };
        if script.trim().is_empty() {
            return self
                .record_failure(&p, "analysis has no script to execute", started, false)
                .await;
        }

        o.store
            .update_message_status(&p.message_id, MessageStatus::ExecutionRunning, Default::default())
            .map_err(|e| HandlerError::Retry(e.to_string()))?;
        o.bus
            .emit(&ProgressEvent::execution_status(&p.session_id, "running", &p.execution_id))
            .map_err(|e| HandlerError::Retry(e.to_string()))?;
        info!(execution_id = %p.execution_id, analysis_id = %p.analysis_id, "execution running");

        match o.sandbox.execute(&script, &p.parameters, p.timeout_seconds).await {
            Ok(outcome) if outcome.success => {
                let result = outcome.data.unwrap_or_else(|| json!({}));
                self.record_success(&p, &analysis.title, result, started).await
            }
            Ok(outcome) => {
                let reason = outcome
                    .error
                    .unwrap_or_else(|| "sandbox reported failure without detail".to_string());
                self.record_failure(&p, &reason, started, false).await
            }
            Err(SandboxError::Timeout { seconds }) => {
                let reason = format!("timeout after {seconds}s");
                self.record_failure(&p, &reason, started, true).await
            }
            Err(e) => self.record_failure(&p, &e.to_string(), started, false).await,
        }
    }

    async fn record_success(
        &self,
        p: &ExecutionJobPayload,
        title: &str,
        result: serde_json::Value,
        started: std::time::Instant,
    ) -> std::result::Result<(), HandlerError> {
        let o = &self.orch;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        o.store
            .update_analysis(
                &p.analysis_id,
                AnalysisUpdate {
                    status: Some(AnalysisStatus::Success),
                    result: Some(result.clone()),
                    execution_time_ms: Some(execution_time_ms),
                    executed_at: Some(now_rfc3339()),
                    ..Default::default()
                },
            )
            .map_err(|e| HandlerError::Retry(e.to_string()))?;

        let summary = format!("Analysis complete: {title}");

        // Message and conversation-store writes happen under the session's
        // advisory lock so they never interleave with an in-flight submit.
        let lock = o.session_lock(&p.session_id);
        {
            let _guard = lock.lock().await;

            o.store
                .update_message_status(
                    &p.message_id,
                    MessageStatus::Completed,
                    MessageUpdate {
                        analysis_id: Some(p.analysis_id.clone()),
                        ..Default::default()
                    },
                )
                .map_err(|e| HandlerError::Retry(e.to_string()))?;

            let mut assistant = ChatMessage::new(&p.session_id, Role::Assistant, &summary);
            assistant.status = MessageStatus::Completed;
            assistant.analysis_id = Some(p.analysis_id.clone());
            // Display snapshot only — the id reference stays authoritative.
            assistant.analysis_snapshot = Some(result.clone());
            o.store
                .create_message(&assistant)
                .map_err(|e| HandlerError::Retry(e.to_string()))?;

            o.sessions.complete_turn(&p.session_id, &summary);
        }

        // Populate the result cache so an identical question answers at
        // intake without queue work.
        if let Ok(Some(msg)) = o.store.get_message(&p.message_id) {
            if let Some(expanded) = msg.expanded_question.as_deref() {
                let key = cache_key(expanded, &serde_json::Map::new());
                if let Err(e) = o.store.cache_put(
                    &key,
                    &result,
                    Some(&p.analysis_id),
                    o.config.cache.ttl_seconds,
                ) {
                    warn!("failed to populate result cache: {e}");
                }
            }
        }

        let mut event = ProgressEvent::execution_status(&p.session_id, "completed", &p.execution_id);
        event
            .details
            .insert("execution_time_ms".into(), json!(execution_time_ms));
        event.details.insert("message_id".into(), json!(p.message_id));
        o.bus.emit(&event).map_err(|e| HandlerError::Retry(e.to_string()))?;

        info!(execution_id = %p.execution_id, execution_time_ms, "execution completed");
        Ok(())
    }

    async fn record_failure(
        &self,
        p: &ExecutionJobPayload,
        reason: &str,
        started: std::time::Instant,
        timed_out: bool,
    ) -> std::result::Result<(), HandlerError> {
        let o = &self.orch;
        let execution_time_ms = started.elapsed().as_millis() as u64;
        warn!(execution_id = %p.execution_id, timed_out, "execution failed: {reason}");

        o.store
            .update_analysis(
                &p.analysis_id,
                AnalysisUpdate {
                    status: Some(AnalysisStatus::Failed),
                    error: Some(reason.to_string()),
                    execution_time_ms: Some(execution_time_ms),
                    executed_at: Some(now_rfc3339()),
                    ..Default::default()
                },
            )
            .map_err(|e| HandlerError::Retry(e.to_string()))?;

        let lock = o.session_lock(&p.session_id);
        {
            let _guard = lock.lock().await;

            o.store
                .update_message_status(
                    &p.message_id,
                    MessageStatus::ExecutionFailed,
                    MessageUpdate {
                        analysis_id: Some(p.analysis_id.clone()),
                        metadata: Some(error_metadata(reason)),
                        ..Default::default()
                    },
                )
                .map_err(|e| HandlerError::Retry(e.to_string()))?;

            let mut assistant = ChatMessage::new(
                &p.session_id,
                Role::Assistant,
                format!("The analysis could not be completed: {reason}"),
            );
            assistant.status = MessageStatus::Failed;
            assistant.analysis_id = Some(p.analysis_id.clone());
            o.store
                .create_message(&assistant)
                .map_err(|e| HandlerError::Retry(e.to_string()))?;
        }

        let mut event = ProgressEvent::execution_status(&p.session_id, "failed", &p.execution_id);
        event.level = finsight_core::types::ProgressLevel::Error;
        event.details.insert("error".into(), json!(reason));
        event.details.insert("message_id".into(), json!(p.message_id));
        o.bus.emit(&event).map_err(|e| HandlerError::Retry(e.to_string()))?;

        if timed_out {
            Err(HandlerError::Timeout(reason.to_string()))
        } else {
            Err(HandlerError::Fatal(reason.to_string()))
        }
    }
}

fn error_metadata(reason: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut m = serde_json::Map::new();
    m.insert("error".into(), json!(reason));
    m.insert("failed_at".into(), json!(now_rfc3339()));
    m
}
