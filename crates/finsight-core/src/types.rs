use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current UTC instant as an RFC3339 string — the storage format for every
/// timestamp column.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Lifecycle of an analysis-bearing chat message, from submission through
/// script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Message created, analysis not started.
    Pending,
    /// The analysis worker has claimed the job.
    AnalysisStarted,
    /// Analysis generated, ready for execution.
    AnalysisCompleted,
    AnalysisFailed,
    /// Execution submitted to the queue.
    ExecutionQueued,
    ExecutionRunning,
    ExecutionCompleted,
    ExecutionFailed,
    /// Everything finished successfully.
    Completed,
    Failed,
}

impl MessageStatus {
    /// True while analysis or execution is still in progress.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            MessageStatus::Pending
                | MessageStatus::AnalysisStarted
                | MessageStatus::ExecutionQueued
                | MessageStatus::ExecutionRunning
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            MessageStatus::AnalysisFailed | MessageStatus::ExecutionFailed | MessageStatus::Failed
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::AnalysisStarted => "analysis_started",
            MessageStatus::AnalysisCompleted => "analysis_completed",
            MessageStatus::AnalysisFailed => "analysis_failed",
            MessageStatus::ExecutionQueued => "execution_queued",
            MessageStatus::ExecutionRunning => "execution_running",
            MessageStatus::ExecutionCompleted => "execution_completed",
            MessageStatus::ExecutionFailed => "execution_failed",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "analysis_started" => Ok(MessageStatus::AnalysisStarted),
            "analysis_completed" => Ok(MessageStatus::AnalysisCompleted),
            "analysis_failed" => Ok(MessageStatus::AnalysisFailed),
            "execution_queued" => Ok(MessageStatus::ExecutionQueued),
            "execution_running" => Ok(MessageStatus::ExecutionRunning),
            "execution_completed" => Ok(MessageStatus::ExecutionCompleted),
            "execution_failed" => Ok(MessageStatus::ExecutionFailed),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// How an incoming user turn relates to the conversation so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Full standalone question.
    Complete,
    /// References prior turns ("what about QQQ to SPY").
    Contextual,
    /// Compares against a prior result ("how does that compare").
    Comparative,
    /// Varies a parameter of the prior analysis ("what if 3% instead").
    Parameter,
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryType::Complete => "complete",
            QueryType::Contextual => "contextual",
            QueryType::Comparative => "comparative",
            QueryType::Parameter => "parameter",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "complete" => Ok(QueryType::Complete),
            "contextual" => Ok(QueryType::Contextual),
            "comparative" => Ok(QueryType::Comparative),
            "parameter" => Ok(QueryType::Parameter),
            other => Err(format!("unknown query type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Success => "success",
            AnalysisStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "success" => Ok(AnalysisStatus::Success),
            "failed" => Ok(AnalysisStatus::Failed),
            other => Err(format!("unknown analysis status: {other}")),
        }
    }
}

/// Lifecycle state of a durable queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible for claiming.
    Queued,
    /// Claimed by a worker; reclaimable once `visible_after` passes.
    Running,
    Succeeded,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Timeout
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "timeout" => Ok(JobStatus::Timeout),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// The two durable queues the orchestrator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Analysis,
    Execution,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Analysis => "analysis",
            QueueName::Execution => "execution",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(QueueName::Analysis),
            "execution" => Ok(QueueName::Execution),
            other => Err(format!("unknown queue: {other}")),
        }
    }
}

// Priority bands: lower number wins.
pub const PRIORITY_HIGH: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 2;
pub const PRIORITY_LOW: u8 = 3;

/// One conversation between a user and the system.
///
/// The session's message rows (ordered by insertion) are the durable truth;
/// any in-memory conversation state is a derived projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    /// UUIDv7 primary key — time-sortable.
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    /// Ids of analyses produced in this session, in creation order.
    pub analysis_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One durable entry in a session's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Authoritative analysis pointer. At most one of the snapshot/reference
    /// pair is read by the core: this one.
    pub analysis_id: Option<String>,
    /// Immutable display snapshot written at completion; never read back.
    pub analysis_snapshot: Option<Value>,
    pub generated_script: Option<String>,
    /// Names of tools the planner invoked while producing the analysis.
    pub tool_calls: Vec<String>,
    pub status: MessageStatus,
    /// Set on user turns once the router has classified them.
    pub query_type: Option<QueryType>,
    /// User turns only — always equals `content` at creation time.
    pub original_question: Option<String>,
    /// Self-contained restatement produced by the router.
    pub expanded_question: Option<String>,
    /// Display-only open map; the core never branches on it.
    pub metadata: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl ChatMessage {
    /// A fresh message in `pending` with defaulted optional fields.
    /// User turns get `original_question` mirrored from the content.
    pub fn new(
        session_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let now = now_rfc3339();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            session_id: session_id.into(),
            role,
            original_question: (role == Role::User).then(|| content.clone()),
            content,
            analysis_id: None,
            analysis_snapshot: None,
            generated_script: None,
            tool_calls: Vec::new(),
            status: MessageStatus::Pending,
            query_type: None,
            expanded_question: None,
            metadata: Map::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// A computation definition (script + parameters) and its last result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    /// Methodology bucket, e.g. "volatility" or "correlation". Reuse is only
    /// permitted within a category.
    pub category: String,
    pub parameters: Map<String, Value>,
    /// Name of the saved script in the script store; the execution worker
    /// loads by this name and falls back to the embedded text.
    pub script_name: Option<String>,
    pub generated_script: String,
    /// Analytics tools the script calls, for catalog display.
    pub mcp_calls: Vec<String>,
    pub data_sources: Vec<String>,
    pub result: Option<Value>,
    pub status: AnalysisStatus,
    pub error: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub executed_at: Option<String>,
    /// Template analyses are parameterizable by the reuse evaluator.
    pub is_template: bool,
    /// Queries recognized as reusing this analysis.
    pub similar_queries: Vec<String>,
    pub reuse_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl Analysis {
    /// A fresh analysis in `pending`, owned by `user_id`.
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            description: String::new(),
            category: String::new(),
            parameters: Map::new(),
            script_name: None,
            generated_script: String::new(),
            mcp_calls: Vec::new(),
            data_sources: Vec::new(),
            result: None,
            status: AnalysisStatus::Pending,
            error: None,
            execution_time_ms: None,
            executed_at: None,
            is_template: false,
            similar_queries: Vec::new(),
            reuse_count: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// A persisted queue job. The payload is opaque JSON at this level; workers
/// deserialize it into the typed payloads below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub payload: Value,
    pub status: JobStatus,
    pub priority: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Instant after which an unfinished claim becomes reclaimable.
    pub visible_after: String,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Payload of an `analysis` queue job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJobPayload {
    pub analysis_request_id: String,
    pub session_id: String,
    pub user_id: String,
    /// The user message whose status tracks this request.
    pub message_id: String,
    pub user_text: String,
    pub expanded_text: String,
    /// When set, the worker parameterizes this existing analysis instead of
    /// generating a new script.
    pub reuse_hint: Option<String>,
}

/// Payload of an `execution` queue job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJobPayload {
    pub execution_id: String,
    pub analysis_id: String,
    pub session_id: String,
    pub user_id: String,
    pub message_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    ExecutionStatus,
    Generic,
}

impl std::fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressEventType::ExecutionStatus => "execution_status",
            ProgressEventType::Generic => "generic",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ProgressEventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "execution_status" => Ok(ProgressEventType::ExecutionStatus),
            "generic" => Ok(ProgressEventType::Generic),
            other => Err(format!("unknown progress event type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for ProgressLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressLevel::Info => "info",
            ProgressLevel::Warn => "warn",
            ProgressLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ProgressLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(ProgressLevel::Info),
            "warn" => Ok(ProgressLevel::Warn),
            "error" => Ok(ProgressLevel::Error),
            other => Err(format!("unknown progress level: {other}")),
        }
    }
}

/// One element of the server-to-client notification stream.
///
/// `processed` is the fan-out monitor's cursor marker, not a delivery
/// receipt — delivery inside the process is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub level: ProgressLevel,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub processed: bool,
    pub created_at: String,
}

impl ProgressEvent {
    /// A generic informational event for a session.
    pub fn info(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(session_id, ProgressEventType::Generic, ProgressLevel::Info, message)
    }

    pub fn error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(session_id, ProgressEventType::Generic, ProgressLevel::Error, message)
    }

    /// An `execution_status` event; the status value goes in `details.status`.
    pub fn execution_status(
        session_id: impl Into<String>,
        status: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        let status = status.into();
        let mut ev = Self::new(
            session_id,
            ProgressEventType::ExecutionStatus,
            ProgressLevel::Info,
            format!("execution {status}"),
        );
        ev.details.insert("status".into(), Value::String(status));
        ev.details
            .insert("execution_id".into(), Value::String(execution_id.into()));
        ev
    }

    fn new(
        session_id: impl Into<String>,
        event_type: ProgressEventType,
        level: ProgressLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            event_type,
            level,
            message: message.into(),
            details: Map::new(),
            processed: false,
            created_at: now_rfc3339(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// One row of the content-addressed result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Stable hash of (question text, sorted parameters).
    pub key: String,
    pub value: Value,
    pub analysis_id: Option<String>,
    pub expires_at: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn message_status_roundtrip() {
        for s in [
            "pending",
            "analysis_started",
            "analysis_completed",
            "analysis_failed",
            "execution_queued",
            "execution_running",
            "execution_completed",
            "execution_failed",
            "completed",
            "failed",
        ] {
            let parsed = MessageStatus::from_str(s).expect("parse failed");
            assert_eq!(parsed.to_string(), s);
        }
        assert!(MessageStatus::from_str("done").is_err());
    }

    #[test]
    fn pending_and_failed_predicates() {
        assert!(MessageStatus::ExecutionRunning.is_pending());
        assert!(!MessageStatus::Completed.is_pending());
        assert!(MessageStatus::AnalysisFailed.is_failed());
        assert!(!MessageStatus::AnalysisCompleted.is_failed());
    }

    #[test]
    fn job_status_terminal() {
        assert!(JobStatus::Timeout.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn execution_status_event_carries_details() {
        let ev = ProgressEvent::execution_status("s-1", "running", "exec-9");
        assert_eq!(ev.event_type, ProgressEventType::ExecutionStatus);
        assert_eq!(ev.details["status"], Value::String("running".into()));
        assert_eq!(ev.details["execution_id"], Value::String("exec-9".into()));
        assert!(!ev.processed);
    }

    #[test]
    fn query_type_serde_matches_wire_form() {
        let j = serde_json::to_string(&QueryType::Comparative).unwrap();
        assert_eq!(j, "\"comparative\"");
        let q: QueryType = serde_json::from_str("\"parameter\"").unwrap();
        assert_eq!(q, QueryType::Parameter);
    }
}
