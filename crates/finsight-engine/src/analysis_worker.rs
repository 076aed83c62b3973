//! Analysis worker — consumes the `analysis` queue and turns an expanded
//! query into a validated script plus parameter binding.
//!
//! Loop: prompt → LM → execute permitted tool calls → inject results →
//! repeat, until the LM emits a terminal JSON naming a saved script, or a
//! freshly written script passes validation. Forbidden tools are refused
//! in-band; the LM sees the refusal and continues planning.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use finsight_core::types::{
    Analysis, AnalysisJobPayload, ExecutionJobPayload, Job, MessageStatus, ProgressEvent,
    PRIORITY_NORMAL,
};
use finsight_index::IndexDoc;
use finsight_llm::{extract_json, send_with_retry, ChatRequest};
use finsight_queue::{HandlerError, JobHandler};
use finsight_store::gateway::MessageUpdate;

use crate::orchestrator::Orchestrator;
use crate::tools::{is_forbidden_tool, planning_tools, to_definitions, PlanState, ToolResult};

const MAX_ITERATIONS: usize = 25;
/// Unparseable terminal output is re-asked this many times before the
/// message fails (validation-class, never retried at queue level).
const PARSE_RETRIES: usize = 2;
/// Distinct validation failures tolerated before giving up on the script.
const MAX_VALIDATION_FAILURES: usize = 3;
/// Transport retries inside each LM call.
const TRANSPORT_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

const PLANNER_SYSTEM_PROMPT: &str = "\
You are a financial-analysis planner. Produce an executable analysis script \
answering the user's question, using only the provided tools: write_script, \
read_script, validate_script, lookup_docs. Do not fetch data or compute \
indicators yourself — the script does that at execution time via the \
analytics library (see lookup_docs).

The script must define `def main(params)` and return a JSON-serializable \
dict. Save it with write_script, check it with validate_script, then finish \
by replying with exactly this JSON object and nothing else:
{\"script_name\": \"...\", \"parameters\": {...}, \"title\": \"...\", \
\"description\": \"...\", \"category\": \"...\", \"mcp_calls\": [\"...\"]}
`category` is the methodology bucket, e.g. volatility, correlation, \
performance, risk.";

pub struct AnalysisHandler {
    orch: Arc<Orchestrator>,
}

impl AnalysisHandler {
    pub fn new(orch: Arc<Orchestrator>) -> Self {
        Self { orch }
    }
}

#[async_trait]
impl JobHandler for AnalysisHandler {
    async fn handle(&self, job: Job) -> std::result::Result<(), HandlerError> {
        let payload: AnalysisJobPayload = serde_json::from_value(job.payload)
            .map_err(|e| HandlerError::Fatal(format!("malformed analysis payload: {e}")))?;
        self.process(payload).await
    }
}

/// Outcome of a successful planning session.
struct Plan {
    script_name: String,
    script: String,
    parameters: Map<String, Value>,
    title: String,
    description: String,
    category: String,
    mcp_calls: Vec<String>,
    tools_used: Vec<String>,
}

enum PlanError {
    /// LM transport kept failing — worth a queue-level retry later.
    Transport(String),
    /// Validation-class: unparseable output, failed validation, iteration
    /// budget exhausted. Not retried.
    Failed(String),
}

impl AnalysisHandler {
    async fn process(&self, p: AnalysisJobPayload) -> std::result::Result<(), HandlerError> {
        let o = &self.orch;
        info!(session_id = %p.session_id, request_id = %p.analysis_request_id, "analysis started");

        o.store
            .update_message_status(&p.message_id, MessageStatus::AnalysisStarted, Default::default())
            .map_err(retriable)?;
        o.bus
            .emit(
                &ProgressEvent::info(&p.session_id, "analysis started")
                    .with_detail("message_id", json!(p.message_id)),
            )
            .map_err(retriable)?;

        let plan = match &p.reuse_hint {
            Some(source_id) => self.plan_from_existing(source_id),
            None => self.run_planning_loop(&p).await,
        };

        let plan = match plan {
            Ok(plan) => plan,
            Err(PlanError::Transport(msg)) => return Err(HandlerError::Retry(msg)),
            Err(PlanError::Failed(msg)) => {
                warn!(session_id = %p.session_id, "analysis failed: {msg}");
                let _ = o.store.update_message_status(
                    &p.message_id,
                    MessageStatus::AnalysisFailed,
                    MessageUpdate {
                        metadata: Some(error_metadata(&msg)),
                        ..Default::default()
                    },
                );
                let _ = o.bus.emit(
                    &ProgressEvent::error(&p.session_id, format!("analysis failed: {msg}"))
                        .with_detail("message_id", json!(p.message_id)),
                );
                return Err(HandlerError::Fatal(msg));
            }
        };

        // Persist the analysis in `pending`; the execution worker is the
        // sole writer of its terminal state.
        let mut analysis = Analysis::new(&p.user_id, &plan.title);
        analysis.description = plan.description;
        analysis.category = plan.category;
        analysis.parameters = plan.parameters;
        analysis.script_name = Some(plan.script_name);
        analysis.generated_script = plan.script;
        analysis.mcp_calls = plan.mcp_calls;
        o.store.create_analysis(&analysis).map_err(retriable)?;
        o.store
            .append_session_analysis(&p.session_id, &analysis.id)
            .map_err(retriable)?;

        // Index the expanded question so later turns find this analysis as
        // a reuse neighbor. Indexing failures are logged, never fatal.
        if let Err(e) = o
            .index
            .save(IndexDoc {
                id: analysis.id.clone(),
                text: p.expanded_text.clone(),
                metadata: index_metadata(&analysis),
            })
            .await
        {
            warn!(analysis_id = %analysis.id, "failed to index analysis: {e}");
        }

        o.store
            .update_message_status(
                &p.message_id,
                MessageStatus::AnalysisCompleted,
                MessageUpdate {
                    analysis_id: Some(analysis.id.clone()),
                    generated_script: Some(analysis.generated_script.clone()),
                    tool_calls: Some(plan.tools_used),
                    ..Default::default()
                },
            )
            .map_err(retriable)?;

        let execution_id = Uuid::new_v4().to_string();
        let payload = ExecutionJobPayload {
            execution_id: execution_id.clone(),
            analysis_id: analysis.id.clone(),
            session_id: p.session_id.clone(),
            user_id: p.user_id.clone(),
            message_id: p.message_id.clone(),
            parameters: analysis.parameters.clone(),
            timeout_seconds: o.config.queue.execution_timeout_seconds,
        };
        o.queue
            .enqueue_execution(&payload, PRIORITY_NORMAL)
            .map_err(retriable)?;
        o.store
            .update_message_status(&p.message_id, MessageStatus::ExecutionQueued, Default::default())
            .map_err(retriable)?;
        o.bus
            .emit(&ProgressEvent::execution_status(&p.session_id, "queued", execution_id))
            .map_err(retriable)?;

        info!(session_id = %p.session_id, analysis_id = %analysis.id, "analysis persisted, execution enqueued");
        Ok(())
    }

    /// Reuse hint: clone the referenced analysis's script instead of
    /// planning from scratch.
    fn plan_from_existing(&self, source_id: &str) -> std::result::Result<Plan, PlanError> {
        let source = self
            .orch
            .store
            .get_analysis(source_id)
            .map_err(|e| PlanError::Transport(e.to_string()))?
            .ok_or_else(|| PlanError::Failed(format!("reuse source not found: {source_id}")))?;
        Ok(Plan {
            script_name: source.script_name.clone().unwrap_or_default(),
            script: source.generated_script.clone(),
            parameters: source.parameters.clone(),
            title: source.title.clone(),
            description: source.description.clone(),
            category: source.category.clone(),
            mcp_calls: source.mcp_calls,
            tools_used: Vec::new(),
        })
    }

    async fn run_planning_loop(&self, p: &AnalysisJobPayload) -> std::result::Result<Plan, PlanError> {
        let o = &self.orch;
        let state = Arc::new(Mutex::new(PlanState::default()));
        let tools = planning_tools(o.scripts.clone(), state.clone());
        let definitions = to_definitions(&tools);

        let mut raw_messages = vec![json!({
            "role": "user",
            "content": format!("Create an analysis for this question:\n{}", p.expanded_text),
        })];
        let mut tools_used: Vec<String> = Vec::new();
        let mut parse_failures = 0usize;
        let mut validation_failures = 0usize;

        for iteration in 0..MAX_ITERATIONS {
            let req = ChatRequest {
                model: o.config.llm.model.clone(),
                system: PLANNER_SYSTEM_PROMPT.to_string(),
                messages: Vec::new(),
                max_tokens: 4096,
                tools: definitions.clone(),
                raw_messages: Some(raw_messages.clone()),
            };

            let resp = send_with_retry(o.llm.as_ref(), &req, TRANSPORT_RETRIES, RETRY_BASE_DELAY)
                .await
                .map_err(|e| {
                    if e.is_transient() {
                        PlanError::Transport(e.to_string())
                    } else {
                        PlanError::Failed(e.to_string())
                    }
                })?;

            if resp.tool_calls.is_empty() {
                // Terminal response expected. Accept a parseable binding, or
                // fall back to a validated script when the model stops
                // talking JSON but the work is done.
                if let Some(plan) = self.parse_terminal(&resp.content, &tools_used) {
                    debug!(iteration, "planning loop complete");
                    return plan;
                }
                if let Some(plan) = self.accept_validated_script(p, &state, &tools_used) {
                    debug!(iteration, "accepting validated script without terminal binding");
                    return Ok(plan);
                }
                parse_failures += 1;
                if parse_failures > PARSE_RETRIES {
                    return Err(PlanError::Failed(
                        "planner output was not parseable after retries".to_string(),
                    ));
                }
                raw_messages.push(json!({ "role": "assistant", "content": resp.content }));
                raw_messages.push(json!({
                    "role": "user",
                    "content": "Respond with exactly the JSON object described in the instructions.",
                }));
                continue;
            }

            // Record the assistant turn with its tool calls, then feed back
            // one result per call.
            raw_messages.push(assistant_turn(&resp.content, &resp.tool_calls));
            for call in &resp.tool_calls {
                tools_used.push(call.name.clone());
                let result = if is_forbidden_tool(&call.name) {
                    warn!(tool = %call.name, "planner requested a forbidden tool");
                    ToolResult::error(format!(
                        "tool '{}' is not available during planning; fetch data inside the \
                         generated script instead",
                        call.name
                    ))
                } else {
                    match tools.iter().find(|t| t.name() == call.name) {
                        Some(tool) => tool.execute(call.input.clone()).await,
                        None => ToolResult::error(format!("unknown tool: {}", call.name)),
                    }
                };

                if call.name == "validate_script" && result.is_error {
                    validation_failures += 1;
                    if validation_failures >= MAX_VALIDATION_FAILURES {
                        return Err(PlanError::Failed(format!(
                            "script validation failed {MAX_VALIDATION_FAILURES} times: {}",
                            result.content
                        )));
                    }
                }

                raw_messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": result.content,
                }));
            }
        }

        Err(PlanError::Failed(format!(
            "planning exceeded {MAX_ITERATIONS} iterations without a result"
        )))
    }

    /// Try to read the terminal `{script_name, parameters, ...}` binding.
    fn parse_terminal(
        &self,
        content: &str,
        tools_used: &[String],
    ) -> Option<std::result::Result<Plan, PlanError>> {
        let v = extract_json(content)?;
        let script_name = v.get("script_name")?.as_str()?.to_string();

        let script = match self.orch.scripts.read_script(&script_name) {
            Ok(s) => s,
            Err(e) => {
                // Named a script that was never saved — validation-class.
                return Some(Err(PlanError::Failed(format!(
                    "terminal response names unsaved script '{script_name}': {e}"
                ))));
            }
        };

        let parameters = v
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mcp_calls = v
            .get("mcp_calls")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|x| x.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Some(Ok(Plan {
            script_name,
            script,
            parameters,
            title: string_field(&v, "title").unwrap_or_else(|| "Untitled analysis".to_string()),
            description: string_field(&v, "description").unwrap_or_default(),
            category: string_field(&v, "category").unwrap_or_else(|| "general".to_string()),
            mcp_calls,
            tools_used: tools_used.to_vec(),
        }))
    }

    /// The OR-branch of the loop's exit condition: a newly written script
    /// passed validation, so the plan is acceptable even without a terminal
    /// binding. Defaults are derived from the query.
    fn accept_validated_script(
        &self,
        p: &AnalysisJobPayload,
        state: &Arc<Mutex<PlanState>>,
        tools_used: &[String],
    ) -> Option<Plan> {
        let state = state.lock().unwrap();
        let name = state
            .written
            .iter()
            .rev()
            .find(|n| state.validated.contains(*n))?
            .clone();
        drop(state);

        let script = self.orch.scripts.read_script(&name).ok()?;
        Some(Plan {
            script_name: name,
            script,
            parameters: Map::new(),
            title: clip(&p.expanded_text, 80),
            description: p.expanded_text.clone(),
            category: "general".to_string(),
            mcp_calls: Vec::new(),
            tools_used: tools_used.to_vec(),
        })
    }
}

fn assistant_turn(content: &str, calls: &[finsight_llm::ToolCall]) -> Value {
    let tool_calls: Vec<Value> = calls
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "type": "function",
                "function": {
                    "name": c.name,
                    "arguments": serde_json::to_string(&c.input).unwrap_or_default(),
                }
            })
        })
        .collect();
    json!({
        "role": "assistant",
        "content": if content.is_empty() { Value::Null } else { json!(content) },
        "tool_calls": tool_calls,
    })
}

fn string_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(String::from)
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max).collect();
        format!("{clipped}…")
    }
}

fn error_metadata(msg: &str) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("error".into(), json!(msg));
    m.insert("failed_at".into(), json!(finsight_core::types::now_rfc3339()));
    m
}

fn index_metadata(analysis: &Analysis) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("analysis_id".into(), json!(analysis.id));
    m.insert("title".into(), json!(analysis.title));
    m.insert("category".into(), json!(analysis.category));
    m
}

fn retriable(e: impl std::fmt::Display) -> HandlerError {
    HandlerError::Retry(e.to_string())
}
