use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18920;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (finsight.toml + FINSIGHT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FinsightConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dialogue: DialogueConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// SSE keep-alive cadence on GET /stream.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            heartbeat_seconds: default_heartbeat_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_model(),
            request_timeout_seconds: default_llm_timeout(),
        }
    }
}

/// The script execution collaborator (POST /execute).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_base_url")]
    pub base_url: String,
    #[serde(default = "default_sandbox_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_url: default_sandbox_base_url(),
            connect_timeout_seconds: default_sandbox_connect_timeout(),
        }
    }
}

/// The vector index collaborator used for neighbor search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_base_url")]
    pub base_url: String,
    #[serde(default = "default_index_collection")]
    pub collection: String,
    /// Neighbors fetched per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            base_url: default_index_base_url(),
            collection: default_index_collection(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptsConfig {
    #[serde(default = "default_scripts_dir")]
    pub dir: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: default_scripts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker idle poll cadence.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_analyses: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    #[serde(default = "default_analysis_max_retries")]
    pub analysis_max_retries: u32,
    #[serde(default = "default_analysis_retry_delay")]
    pub analysis_retry_delay_seconds: u64,
    /// Claim lease on the analysis queue.
    #[serde(default = "default_analysis_visibility")]
    pub analysis_visibility_seconds: u64,
    /// Claim lease on the execution queue.
    #[serde(default = "default_execution_visibility")]
    pub execution_visibility_seconds: u64,
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            max_concurrent_analyses: default_max_concurrent(),
            max_concurrent_executions: default_max_concurrent(),
            analysis_max_retries: default_analysis_max_retries(),
            analysis_retry_delay_seconds: default_analysis_retry_delay(),
            analysis_visibility_seconds: default_analysis_visibility(),
            execution_visibility_seconds: default_execution_visibility(),
            execution_timeout_seconds: default_execution_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Idle conversation stores are evicted after this long.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    /// Router confidence below this downgrades to needs-confirmation.
    #[serde(default = "default_confidence_low")]
    pub router_confidence_low: f64,
    /// Neighbors below this similarity never reach the reuse evaluator.
    #[serde(default = "default_reuse_threshold")]
    pub reuse_similarity_threshold: f64,
    /// Turns of history included in the router prompt.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            router_confidence_low: default_confidence_low(),
            reuse_similarity_threshold: default_reuse_threshold(),
            context_turns: default_context_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_progress_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_progress_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_heartbeat_seconds() -> u64 {
    15
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.finsight/finsight.db", home)
}
fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "gpt-oss:20b".to_string()
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_sandbox_base_url() -> String {
    "http://localhost:8011".to_string()
}
fn default_sandbox_connect_timeout() -> u64 {
    10
}
fn default_index_base_url() -> String {
    "http://localhost:8050".to_string()
}
fn default_index_collection() -> String {
    "analyses".to_string()
}
fn default_top_k() -> usize {
    5
}
fn default_scripts_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.finsight/scripts", home)
}
fn default_poll_interval() -> u64 {
    5
}
fn default_max_concurrent() -> usize {
    3
}
fn default_analysis_max_retries() -> u32 {
    3
}
fn default_analysis_retry_delay() -> u64 {
    60
}
fn default_analysis_visibility() -> u64 {
    120
}
fn default_execution_visibility() -> u64 {
    600
}
fn default_execution_timeout() -> u64 {
    300
}
fn default_session_ttl() -> u64 {
    900
}
fn default_confidence_low() -> f64 {
    0.5
}
fn default_reuse_threshold() -> f64 {
    0.7
}
fn default_context_turns() -> usize {
    5
}
fn default_progress_poll_ms() -> u64 {
    500
}
fn default_cache_ttl() -> u64 {
    86400
}

impl FinsightConfig {
    /// Load config from a TOML file with FINSIGHT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. FINSIGHT_CONFIG env var
    ///   3. ~/.finsight/finsight.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("FINSIGHT_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: FinsightConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FINSIGHT_").split("_"))
            .extract()
            .map_err(|e| crate::error::FinsightError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.finsight/finsight.toml", home)
}
