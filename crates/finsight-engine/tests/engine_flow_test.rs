//! End-to-end flows through the orchestrator with scripted collaborators:
//! intake → analysis worker → execution worker, plus the reuse, cache,
//! clarification and failure paths.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use finsight_core::config::FinsightConfig;
use finsight_core::types::{
    AnalysisStatus, JobStatus, MessageStatus, ProgressEventType, QueryType, QueueName, Role,
};
use finsight_engine::{
    AnalysisHandler, ExecutionHandler, Orchestrator, Sandbox, SandboxError, SandboxOutcome,
    ScriptStore, SubmitStatus,
};
use finsight_index::{IndexDoc, IndexError, Neighbor, VectorIndex};
use finsight_llm::{ChatRequest, ChatResponse, LlmProvider, ProviderError, ToolCall};
use finsight_queue::{HandlerError, JobHandler};
use finsight_store::StoreGateway;

// --- scripted collaborators ------------------------------------------------

/// Routes scripted replies by which subsystem's system prompt is calling.
struct StubLlm {
    router_replies: Mutex<Vec<String>>,
    reuse_reply: Mutex<Option<String>>,
    planner_mode: PlannerMode,
    planner_step: AtomicUsize,
}

#[derive(Clone)]
enum PlannerMode {
    /// write_script + validate_script (optionally after a forbidden call),
    /// then the terminal JSON binding.
    WellBehaved { forbidden_first: bool },
    /// Never emits tool calls or parseable JSON.
    Garbage,
}

impl StubLlm {
    fn new(planner_mode: PlannerMode) -> Arc<Self> {
        Arc::new(Self {
            router_replies: Mutex::new(Vec::new()),
            reuse_reply: Mutex::new(None),
            planner_mode,
            planner_step: AtomicUsize::new(0),
        })
    }

    fn push_router_reply(&self, reply: &str) {
        self.router_replies.lock().unwrap().push(reply.to_string());
    }

    fn set_reuse_reply(&self, reply: &str) {
        *self.reuse_reply.lock().unwrap() = Some(reply.to_string());
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            model: "stub".into(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: "stop".into(),
            tool_calls: Vec::new(),
        }
    }

    fn with_tools(calls: Vec<ToolCall>) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            model: "stub".into(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: "tool_calls".into(),
            tool_calls: calls,
        }
    }
}

const SCRIPT_BODY: &str = "def main(params):\n    return run()\n";

#[async_trait]
impl LlmProvider for StubLlm {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        if req.system.contains("financial-question router") {
            let mut replies = self.router_replies.lock().unwrap();
            assert!(!replies.is_empty(), "router called without a scripted reply");
            return Ok(Self::text(&replies.remove(0)));
        }
        if req.system.contains("reuse evaluator") {
            let reply = self
                .reuse_reply
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| json!({"should_reuse": false, "reason": "none"}).to_string());
            return Ok(Self::text(&reply));
        }

        // Planner.
        match &self.planner_mode {
            PlannerMode::Garbage => Ok(Self::text("shrug, no structure here")),
            PlannerMode::WellBehaved { forbidden_first } => {
                match self.planner_step.fetch_add(1, Ordering::SeqCst) {
                    0 => {
                        let mut calls = Vec::new();
                        if *forbidden_first {
                            calls.push(ToolCall {
                                id: "call_0".into(),
                                name: "get_stock_prices".into(),
                                input: json!({"symbols": ["NVDA"]}),
                            });
                        }
                        calls.push(ToolCall {
                            id: "call_1".into(),
                            name: "write_script".into(),
                            input: json!({"name": "volatility_top5.py", "content": SCRIPT_BODY}),
                        });
                        calls.push(ToolCall {
                            id: "call_2".into(),
                            name: "validate_script".into(),
                            input: json!({"name": "volatility_top5.py"}),
                        });
                        Ok(Self::with_tools(calls))
                    }
                    _ => Ok(Self::text(
                        &json!({
                            "script_name": "volatility_top5.py",
                            "parameters": {"timeframe": "monthly", "top_n": 5},
                            "title": "Top 5 most volatile stocks",
                            "description": "Ranks symbols by rolling volatility.",
                            "category": "volatility",
                            "mcp_calls": ["rolling_volatility"],
                        })
                        .to_string(),
                    )),
                }
            }
        }
    }
}

#[derive(Default)]
struct StubIndex {
    neighbors: Mutex<Vec<Neighbor>>,
    saved: Mutex<Vec<IndexDoc>>,
}

impl StubIndex {
    fn set_neighbors(&self, neighbors: Vec<Neighbor>) {
        *self.neighbors.lock().unwrap() = neighbors;
    }
}

#[async_trait]
impl VectorIndex for StubIndex {
    async fn save(&self, doc: IndexDoc) -> Result<(), IndexError> {
        self.saved.lock().unwrap().push(doc);
        Ok(())
    }

    async fn search(
        &self,
        _query: &str,
        _top_k: usize,
        min_similarity: f64,
    ) -> Result<Vec<Neighbor>, IndexError> {
        Ok(self
            .neighbors
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.similarity >= min_similarity)
            .cloned()
            .collect())
    }
}

struct StubSandbox {
    outcome: Mutex<SandboxOutcome>,
}

impl StubSandbox {
    fn success(data: Value) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(SandboxOutcome {
                success: true,
                data: Some(data),
                error: None,
                execution_time: Some(0.42),
            }),
        })
    }

    fn set_result(&self, data: Value) {
        *self.outcome.lock().unwrap() = SandboxOutcome {
            success: true,
            data: Some(data),
            error: None,
            execution_time: Some(0.42),
        };
    }
}

#[async_trait]
impl Sandbox for StubSandbox {
    async fn execute(
        &self,
        _script: &str,
        _parameters: &Map<String, Value>,
        _timeout_seconds: u64,
    ) -> Result<SandboxOutcome, SandboxError> {
        Ok(self.outcome.lock().unwrap().clone())
    }
}

struct MemScriptStore {
    files: Mutex<HashMap<String, String>>,
}

impl MemScriptStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
        })
    }
}

impl ScriptStore for MemScriptStore {
    fn read_script(&self, name: &str) -> io::Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn write_script(&self, name: &str, content: &str) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_string());
        Ok(())
    }

    fn list_scripts(&self) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// --- harness ---------------------------------------------------------------

struct Harness {
    orch: Arc<Orchestrator>,
    llm: Arc<StubLlm>,
    index: Arc<StubIndex>,
    sandbox: Arc<StubSandbox>,
}

fn harness(planner_mode: PlannerMode) -> Harness {
    let store = Arc::new(StoreGateway::in_memory().unwrap());
    let llm = StubLlm::new(planner_mode);
    let index = Arc::new(StubIndex::default());
    let sandbox = StubSandbox::success(json!({
        "top5": ["NVDA", "AMD", "TSLA", "MSTR", "COIN"]
    }));
    let scripts = MemScriptStore::new();
    let orch = Arc::new(Orchestrator::new(
        FinsightConfig::default(),
        store,
        llm.clone(),
        index.clone(),
        sandbox.clone(),
        scripts,
    ));
    Harness {
        orch,
        llm,
        index,
        sandbox,
    }
}

/// Claim the next job of a queue and run it through a handler, recording
/// the outcome the way the queue worker would.
async fn run_next_job<H: JobHandler>(orch: &Orchestrator, queue: QueueName, handler: &H) -> JobStatus {
    let job = orch
        .store
        .claim_next(queue, "test-worker", 300)
        .unwrap()
        .unwrap_or_else(|| panic!("no job queued on {queue}"));
    let id = job.id.clone();
    match handler.handle(job).await {
        Ok(()) => {
            orch.store.complete_job(&id, JobStatus::Succeeded, None).unwrap();
            JobStatus::Succeeded
        }
        Err(HandlerError::Retry(m)) => orch.store.fail_with_retry(&id, &m, 0, 3).unwrap(),
        Err(HandlerError::Fatal(m)) => {
            orch.store.complete_job(&id, JobStatus::Failed, Some(&m)).unwrap();
            JobStatus::Failed
        }
        Err(HandlerError::Timeout(m)) => {
            orch.store.complete_job(&id, JobStatus::Timeout, Some(&m)).unwrap();
            JobStatus::Timeout
        }
    }
}

fn queue_is_empty(orch: &Orchestrator, queue: QueueName) -> bool {
    orch.store.claim_next(queue, "probe", 1).unwrap().is_none()
}

const FIRST_QUESTION: &str = "What are the top 5 most volatile stocks this month?";

/// Full first-turn pipeline; returns (session_id, user message id).
async fn run_first_turn(h: &Harness) -> (String, String) {
    let outcome = h.orch.submit(None, "trader1", FIRST_QUESTION).await.unwrap();
    assert_eq!(outcome.status, SubmitStatus::Accepted);

    let analysis_handler = AnalysisHandler::new(h.orch.clone());
    assert_eq!(
        run_next_job(&h.orch, QueueName::Analysis, &analysis_handler).await,
        JobStatus::Succeeded
    );
    let execution_handler = ExecutionHandler::new(h.orch.clone());
    assert_eq!(
        run_next_job(&h.orch, QueueName::Execution, &execution_handler).await,
        JobStatus::Succeeded
    );
    (outcome.session_id, outcome.message_id)
}

// --- scenarios -------------------------------------------------------------

#[tokio::test]
async fn first_turn_end_to_end() {
    let h = harness(PlannerMode::WellBehaved {
        forbidden_first: true,
    });
    let (session_id, message_id) = run_first_turn(&h).await;

    // User message carries the classification and the analysis reference.
    let user_msg = h.orch.store.get_message(&message_id).unwrap().unwrap();
    assert_eq!(user_msg.query_type, Some(QueryType::Complete));
    assert_eq!(user_msg.expanded_question.as_deref(), Some(FIRST_QUESTION));
    assert_eq!(user_msg.status, MessageStatus::Completed);
    let analysis_id = user_msg.analysis_id.expect("user message references the analysis");
    // The refused data-fetch call is recorded alongside the permitted ones.
    assert!(user_msg.tool_calls.contains(&"get_stock_prices".to_string()));
    assert!(user_msg.tool_calls.contains(&"write_script".to_string()));

    // The analysis ran to success with the sandbox result.
    let analysis = h.orch.store.get_analysis(&analysis_id).unwrap().unwrap();
    assert_eq!(analysis.category, "volatility");
    assert_eq!(analysis.status, AnalysisStatus::Success);
    assert!(analysis.execution_time_ms.is_some());
    let result = analysis.result.unwrap();
    assert_eq!(result["top5"], json!(["NVDA", "AMD", "TSLA", "MSTR", "COIN"]));

    // Timeline: user turn then assistant completion, nothing interleaved.
    let messages = h.orch.store.list_session_messages(&session_id, 20).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].status, MessageStatus::Completed);
    assert_eq!(messages[1].analysis_id.as_deref(), Some(analysis_id.as_str()));
    assert!(messages[1].analysis_snapshot.is_some());

    // Progress log carries the start and the terminal completion.
    let events = h.orch.store.poll_unprocessed_events(50).unwrap();
    assert!(events.iter().any(|e| e.message == "analysis started"));
    assert!(events.iter().any(|e| {
        e.event_type == ProgressEventType::ExecutionStatus
            && e.details.get("status") == Some(&json!("completed"))
    }));

    // The expanded question was indexed for future reuse.
    let saved = h.index.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].text, FIRST_QUESTION);
    assert_eq!(saved[0].metadata["category"], json!("volatility"));

    // Both queues drained.
    assert!(queue_is_empty(&h.orch, QueueName::Analysis));
    assert!(queue_is_empty(&h.orch, QueueName::Execution));
}

#[tokio::test]
async fn parameter_turn_reuses_the_prior_analysis() {
    let h = harness(PlannerMode::WellBehaved {
        forbidden_first: false,
    });
    let (session_id, first_message_id) = run_first_turn(&h).await;
    let first_analysis_id = h
        .orch
        .store
        .get_message(&first_message_id)
        .unwrap()
        .unwrap()
        .analysis_id
        .unwrap();

    // The index now knows the first analysis; the evaluator will accept it.
    h.index.set_neighbors(vec![Neighbor {
        id: first_analysis_id.clone(),
        similarity: 0.92,
        metadata: {
            let mut m = Map::new();
            m.insert("analysis_id".into(), json!(first_analysis_id));
            m
        },
    }]);
    h.llm.set_reuse_reply(
        &json!({
            "should_reuse": true,
            "analysis_id": first_analysis_id,
            "category": "volatility",
            "new_parameters": {"timeframe": "weekly"},
            "reason": "same methodology, different timeframe",
        })
        .to_string(),
    );
    h.llm.push_router_reply(
        &json!({
            "query_type": "parameter",
            "expanded_query": "What are the top 5 most volatile stocks, weekly timeframe?",
            "confidence": 0.9,
        })
        .to_string(),
    );
    h.sandbox.set_result(json!({"timeframe": "weekly", "top5": ["NVDA", "COIN"]}));

    let outcome = h
        .orch
        .submit(Some(&session_id), "trader1", "what about weekly instead?")
        .await
        .unwrap();
    assert_eq!(outcome.status, SubmitStatus::Reused);

    // No analysis-generation work: the execution was enqueued directly.
    assert!(queue_is_empty(&h.orch, QueueName::Analysis));

    let execution_handler = ExecutionHandler::new(h.orch.clone());
    assert_eq!(
        run_next_job(&h.orch, QueueName::Execution, &execution_handler).await,
        JobStatus::Succeeded
    );

    // A second analysis exists, derived from the first, with the weekly
    // parameter and the fresh result.
    let user_msg = h.orch.store.get_message(&outcome.message_id).unwrap().unwrap();
    assert_eq!(user_msg.query_type, Some(QueryType::Parameter));
    let second_analysis_id = user_msg.analysis_id.unwrap();
    assert_ne!(second_analysis_id, first_analysis_id);

    let second = h.orch.store.get_analysis(&second_analysis_id).unwrap().unwrap();
    assert_eq!(second.parameters["timeframe"], json!("weekly"));
    assert_eq!(second.status, AnalysisStatus::Success);
    assert_eq!(second.result.unwrap()["timeframe"], json!("weekly"));
    assert_eq!(second.generated_script, SCRIPT_BODY);

    let first = h.orch.store.get_analysis(&first_analysis_id).unwrap().unwrap();
    assert_eq!(first.reuse_count, 1);
    assert_eq!(
        first.similar_queries,
        vec!["What are the top 5 most volatile stocks, weekly timeframe?"]
    );
}

#[tokio::test]
async fn referential_first_turn_needs_clarification() {
    let h = harness(PlannerMode::WellBehaved {
        forbidden_first: false,
    });
    let outcome = h.orch.submit(None, "trader1", "what about QQQ").await.unwrap();

    assert_eq!(outcome.status, SubmitStatus::ClarificationNeeded);
    let reply = outcome.reply.expect("clarification carries a reply");
    assert!(reply.contains("full question"));

    // No queue work, no analyses.
    assert!(queue_is_empty(&h.orch, QueueName::Analysis));
    assert!(queue_is_empty(&h.orch, QueueName::Execution));
    let messages = h
        .orch
        .store
        .list_session_messages(&outcome.session_id, 20)
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.analysis_id.is_none()));
}

#[tokio::test]
async fn identical_question_answers_from_the_result_cache() {
    let h = harness(PlannerMode::WellBehaved {
        forbidden_first: false,
    });
    let (session_id, _) = run_first_turn(&h).await;

    // Same question again: the router classifies it, the cache answers it.
    h.llm.push_router_reply(
        &json!({
            "query_type": "complete",
            "expanded_query": FIRST_QUESTION,
            "confidence": 0.95,
        })
        .to_string(),
    );

    let outcome = h
        .orch
        .submit(Some(&session_id), "trader1", FIRST_QUESTION)
        .await
        .unwrap();
    assert_eq!(outcome.status, SubmitStatus::Reused);
    assert!(outcome.reply.is_some());

    // Nothing was enqueued, and the stream converges via a synthetic
    // completion event.
    assert!(queue_is_empty(&h.orch, QueueName::Analysis));
    assert!(queue_is_empty(&h.orch, QueueName::Execution));
    let events = h.orch.store.poll_unprocessed_events(50).unwrap();
    assert!(events.iter().any(|e| {
        e.details.get("cached") == Some(&json!(true))
            && e.details.get("status") == Some(&json!("completed"))
    }));
}

#[tokio::test]
async fn unparseable_planner_output_fails_the_message() {
    let h = harness(PlannerMode::Garbage);
    let outcome = h.orch.submit(None, "trader1", FIRST_QUESTION).await.unwrap();
    assert_eq!(outcome.status, SubmitStatus::Accepted);

    let analysis_handler = AnalysisHandler::new(h.orch.clone());
    assert_eq!(
        run_next_job(&h.orch, QueueName::Analysis, &analysis_handler).await,
        JobStatus::Failed
    );

    let user_msg = h.orch.store.get_message(&outcome.message_id).unwrap().unwrap();
    assert_eq!(user_msg.status, MessageStatus::AnalysisFailed);
    assert!(user_msg.metadata.get("error").is_some());

    // A final error-level event reaches the progress log; no execution was
    // ever enqueued.
    let events = h.orch.store.poll_unprocessed_events(50).unwrap();
    assert!(events
        .iter()
        .any(|e| e.level == finsight_core::types::ProgressLevel::Error
            && e.message.contains("analysis failed")));
    assert!(queue_is_empty(&h.orch, QueueName::Execution));
}

#[tokio::test]
async fn concurrent_same_session_submits_serialize() {
    let h = harness(PlannerMode::WellBehaved {
        forbidden_first: false,
    });
    let session_id = {
        // Seed the session with a completed first turn so both concurrent
        // submissions go through the router.
        run_first_turn(&h).await.0
    };
    for _ in 0..2 {
        h.llm.push_router_reply(
            &json!({
                "query_type": "complete",
                "expanded_query": "ignored for complete",
                "confidence": 0.9,
            })
            .to_string(),
        );
    }

    let (a, b) = tokio::join!(
        h.orch.submit(Some(&session_id), "trader1", "Show momentum leaders this quarter"),
        h.orch.submit(Some(&session_id), "trader1", "Show laggards this quarter"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.status, SubmitStatus::Accepted);
    assert_eq!(b.status, SubmitStatus::Accepted);

    // Both user messages landed, in some order, with no assistant between
    // them and non-decreasing timestamps.
    let messages = h.orch.store.list_session_messages(&session_id, 20).unwrap();
    let tail: Vec<_> = messages.iter().skip(2).collect();
    assert_eq!(tail.len(), 2);
    assert!(tail.iter().all(|m| m.role == Role::User));
    assert!(tail[0].created_at <= tail[1].created_at);
    let user_order: Vec<String> = tail.iter().map(|m| m.id.clone()).collect();

    // Drain both pipelines; claims come back in enqueue order, so the
    // assistant completions land in the same order as the user messages.
    let analysis_handler = AnalysisHandler::new(h.orch.clone());
    let execution_handler = ExecutionHandler::new(h.orch.clone());
    for _ in 0..2 {
        assert_eq!(
            run_next_job(&h.orch, QueueName::Analysis, &analysis_handler).await,
            JobStatus::Succeeded
        );
        assert_eq!(
            run_next_job(&h.orch, QueueName::Execution, &execution_handler).await,
            JobStatus::Succeeded
        );
    }

    let messages = h.orch.store.list_session_messages(&session_id, 20).unwrap();
    let assistants: Vec<_> = messages
        .iter()
        .skip(2)
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistants.len(), 2);
    let users_by_analysis: Vec<String> = assistants
        .iter()
        .map(|a| {
            let analysis_id = a.analysis_id.clone().unwrap();
            messages
                .iter()
                .find(|m| m.role == Role::User && m.analysis_id.as_deref() == Some(&analysis_id))
                .map(|m| m.id.clone())
                .unwrap()
        })
        .collect();
    assert_eq!(users_by_analysis, user_order, "assistant order mirrors user order");
}
