//! Intake dispatcher — the single entry point for a user turn.
//!
//! Drives session cache → router → (direct reply | reuse | enqueue) and
//! returns a message id the client correlates with the progress stream.

use serde_json::{json, Map};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use finsight_core::types::{
    AnalysisJobPayload, ChatMessage, ExecutionJobPayload, MessageStatus, ProgressEvent, QueryType,
    Role, PRIORITY_NORMAL,
};
use finsight_dialogue::{NeighborAnalysis, ReuseDecision, RoutedQuery, Turn};
use finsight_store::gateway::MessageUpdate;
use finsight_store::cache_key;

use crate::error::Result;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// Queued for analysis or execution; results arrive on the stream.
    Accepted,
    /// Served from the result cache or an existing analysis's script.
    Reused,
    /// The router needs a restated question; nothing was enqueued.
    ClarificationNeeded,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitOutcome {
    pub session_id: String,
    pub message_id: String,
    pub status: SubmitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

impl Orchestrator {
    /// Accept one user turn. Steps 2–8 run under the session's advisory
    /// lock, so concurrent submissions on the same session serialize while
    /// different sessions proceed in parallel.
    #[instrument(skip(self, text))]
    pub async fn submit(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        text: &str,
    ) -> Result<SubmitOutcome> {
        let session_id = self.sessions.get_or_create(session_id, user_id)?;
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        let user_msg = ChatMessage::new(&session_id, Role::User, text);
        self.store.create_message(&user_msg)?;

        let snapshot = self.sessions.get(&session_id).unwrap_or_default();
        let routed = self.router.classify_and_expand(&snapshot, text).await?;

        let (query_type, expanded) = match routed {
            RoutedQuery::NeedsConfirmation { message }
            | RoutedQuery::NeedsClarification { message } => {
                return self.reply_without_work(&session_id, &user_msg.id, message);
            }
            RoutedQuery::Complete { expanded } => (QueryType::Complete, expanded),
            RoutedQuery::Expanded {
                query_type,
                expanded,
                ..
            } => (query_type, expanded),
        };

        self.store.update_message_status(
            &user_msg.id,
            MessageStatus::Pending,
            MessageUpdate {
                query_type: Some(query_type),
                expanded_question: Some(expanded.clone()),
                ..Default::default()
            },
        )?;
        self.sessions.add_turn(
            &session_id,
            Turn {
                user_query: text.to_string(),
                expanded_query: expanded.clone(),
                query_type,
                analysis_summary: None,
            },
        );

        // Result cache first: identical questions answer without any queue
        // work. The expansion already encodes parameter variations, so the
        // question-only key is the one the execution worker populated.
        let key = cache_key(&expanded, &Map::new());
        if let Some(entry) = self.store.cache_get(&key)? {
            info!(%session_id, "result cache hit");
            return self.reply_from_cache(&session_id, &user_msg.id, &expanded, entry);
        }

        // Reuse applies to self-contained and parameter turns; contextual
        // and comparative rewrites go through full generation.
        if matches!(query_type, QueryType::Complete | QueryType::Parameter) {
            let neighbors = self.neighbor_analyses(&expanded).await;
            if !neighbors.is_empty() {
                if let ReuseDecision::Reuse {
                    analysis_id,
                    new_parameters,
                } = self.reuse.evaluate(&expanded, &neighbors).await
                {
                    return self
                        .enqueue_reused_execution(
                            &session_id,
                            user_id,
                            &user_msg.id,
                            &expanded,
                            &analysis_id,
                            new_parameters,
                        )
                        .await;
                }
            }
        }

        // Full pipeline: queue an analysis job for the worker.
        let payload = AnalysisJobPayload {
            analysis_request_id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            message_id: user_msg.id.clone(),
            user_text: text.to_string(),
            expanded_text: expanded,
            reuse_hint: None,
        };
        self.queue
            .enqueue_analysis(&payload, PRIORITY_NORMAL, self.config.queue.analysis_max_retries)?;
        self.bus.emit(
            &ProgressEvent::info(&session_id, "analysis queued")
                .with_detail("message_id", json!(user_msg.id)),
        )?;
        info!(%session_id, message_id = %user_msg.id, "analysis enqueued");

        Ok(SubmitOutcome {
            session_id,
            message_id: user_msg.id,
            status: SubmitStatus::Accepted,
            reply: None,
        })
    }

    /// Router asked for confirmation/clarification: record the exchange and
    /// return the reply inline. No queue work.
    fn reply_without_work(
        &self,
        session_id: &str,
        user_message_id: &str,
        message: String,
    ) -> Result<SubmitOutcome> {
        self.store.update_message_status(
            user_message_id,
            MessageStatus::Completed,
            MessageUpdate {
                metadata: Some(metadata("response_type", "clarification")),
                ..Default::default()
            },
        )?;
        let mut assistant = ChatMessage::new(session_id, Role::Assistant, &message);
        assistant.status = MessageStatus::Completed;
        self.store.create_message(&assistant)?;

        Ok(SubmitOutcome {
            session_id: session_id.to_string(),
            message_id: user_message_id.to_string(),
            status: SubmitStatus::ClarificationNeeded,
            reply: Some(message),
        })
    }

    /// Cache hit: answer from the stored result, emit a synthetic
    /// completion event so stream subscribers converge the same way they
    /// would for a real run.
    fn reply_from_cache(
        &self,
        session_id: &str,
        user_message_id: &str,
        expanded: &str,
        entry: finsight_core::types::CacheEntry,
    ) -> Result<SubmitOutcome> {
        let reply = format!("Using a cached result for: {expanded}");

        self.store.update_message_status(
            user_message_id,
            MessageStatus::Completed,
            MessageUpdate {
                analysis_id: entry.analysis_id.clone(),
                metadata: Some(metadata("response_type", "cached")),
                ..Default::default()
            },
        )?;

        let mut assistant = ChatMessage::new(session_id, Role::Assistant, &reply);
        assistant.status = MessageStatus::Completed;
        assistant.analysis_id = entry.analysis_id.clone();
        assistant.analysis_snapshot = Some(entry.value.clone());
        self.store.create_message(&assistant)?;

        self.sessions.complete_turn(session_id, &reply);

        let mut event =
            ProgressEvent::execution_status(session_id, "completed", Uuid::new_v4().to_string());
        event.details.insert("cached".into(), json!(true));
        event
            .details
            .insert("message_id".into(), json!(user_message_id));
        self.bus.emit(&event)?;

        Ok(SubmitOutcome {
            session_id: session_id.to_string(),
            message_id: user_message_id.to_string(),
            status: SubmitStatus::Reused,
            reply: Some(reply),
        })
    }

    /// Reuse decision: clone the neighbor's script under new parameters and
    /// queue an execution directly — the analysis worker is skipped.
    async fn enqueue_reused_execution(
        &self,
        session_id: &str,
        user_id: &str,
        user_message_id: &str,
        expanded: &str,
        source_analysis_id: &str,
        new_parameters: Map<String, serde_json::Value>,
    ) -> Result<SubmitOutcome> {
        let source = self
            .store
            .get_analysis(source_analysis_id)?
            .ok_or_else(|| crate::error::EngineError::NotFound {
                what: "analysis",
                id: source_analysis_id.to_string(),
            })?;

        let mut analysis = finsight_core::types::Analysis::new(user_id, source.title.clone());
        analysis.description = source.description.clone();
        analysis.category = source.category.clone();
        analysis.script_name = source.script_name.clone();
        analysis.generated_script = source.generated_script.clone();
        analysis.mcp_calls = source.mcp_calls.clone();
        analysis.data_sources = source.data_sources.clone();
        analysis.parameters = source.parameters.clone();
        analysis.parameters.extend(new_parameters);
        self.store.create_analysis(&analysis)?;
        self.store.append_session_analysis(session_id, &analysis.id)?;
        self.store.record_reuse(source_analysis_id, expanded)?;

        self.store.update_message_status(
            user_message_id,
            MessageStatus::ExecutionQueued,
            MessageUpdate {
                analysis_id: Some(analysis.id.clone()),
                metadata: Some(metadata("response_type", "reused")),
                ..Default::default()
            },
        )?;

        let execution_id = Uuid::new_v4().to_string();
        let payload = ExecutionJobPayload {
            execution_id: execution_id.clone(),
            analysis_id: analysis.id.clone(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            message_id: user_message_id.to_string(),
            parameters: analysis.parameters.clone(),
            timeout_seconds: self.config.queue.execution_timeout_seconds,
        };
        self.queue.enqueue_execution(&payload, PRIORITY_NORMAL)?;
        self.bus
            .emit(&ProgressEvent::execution_status(session_id, "queued", execution_id))?;
        info!(
            session_id,
            source_analysis_id,
            analysis_id = %analysis.id,
            "reusing existing analysis, execution enqueued"
        );

        Ok(SubmitOutcome {
            session_id: session_id.to_string(),
            message_id: user_message_id.to_string(),
            status: SubmitStatus::Reused,
            reply: None,
        })
    }

    /// Join index hits with their analysis rows. Index failures degrade to
    /// "no neighbors" — generation always remains available.
    async fn neighbor_analyses(&self, expanded: &str) -> Vec<NeighborAnalysis> {
        let hits = match self
            .index
            .search(
                expanded,
                self.config.index.top_k,
                self.config.dialogue.reuse_similarity_threshold,
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("vector index search failed, skipping reuse: {e}");
                return Vec::new();
            }
        };

        let mut neighbors = Vec::new();
        for hit in hits {
            let analysis_id = hit
                .metadata
                .get("analysis_id")
                .and_then(|v| v.as_str())
                .unwrap_or(&hit.id)
                .to_string();
            match self.store.get_analysis(&analysis_id) {
                Ok(Some(analysis)) => neighbors.push(NeighborAnalysis {
                    analysis_id,
                    title: analysis.title,
                    category: analysis.category,
                    similarity: hit.similarity,
                    parameters: analysis.parameters,
                }),
                Ok(None) => warn!(%analysis_id, "index hit points at a missing analysis"),
                Err(e) => warn!(%analysis_id, "failed to load neighbor analysis: {e}"),
            }
        }
        neighbors
    }
}

fn metadata(key: &str, value: &str) -> Map<String, serde_json::Value> {
    let mut m = Map::new();
    m.insert(key.to_string(), json!(value));
    m
}
