//! Planning tools for the analysis worker's tool loop.
//!
//! The planner may only write, read and validate scripts, and look up
//! analytics docstrings. Data-fetch and compute tools belong to the script
//! itself; requests for them are refused and the refusal is fed back to the
//! LM as an error tool result.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use finsight_llm::ToolDefinition;

use crate::scripts::ScriptStore;

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait all planning tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Convert a slice of tools to API-level tool definitions.
pub fn to_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}

/// Shared scratch state for one planning session: which scripts were written
/// and which of them passed validation.
#[derive(Debug, Default)]
pub struct PlanState {
    pub written: Vec<String>,
    pub validated: HashSet<String>,
}

pub type SharedPlanState = Arc<Mutex<PlanState>>;

/// The full permitted tool set for one planning session.
pub fn planning_tools(scripts: Arc<dyn ScriptStore>, state: SharedPlanState) -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(WriteScriptTool {
            scripts: scripts.clone(),
            state: state.clone(),
        }),
        Box::new(ReadScriptTool {
            scripts: scripts.clone(),
        }),
        Box::new(ValidateScriptTool { scripts, state }),
        Box::new(LookupDocsTool),
    ]
}

/// Tool names the planner may never call: fetching data or computing
/// indicators happens inside the generated script, not the plan.
pub fn is_forbidden_tool(name: &str) -> bool {
    const FORBIDDEN_PREFIXES: &[&str] = &["get_", "fetch_", "compute_", "calc_", "download_"];
    const FORBIDDEN: &[&str] = &[
        "stock_prices",
        "market_data",
        "portfolio_positions",
        "run_analysis",
        "execute_script",
    ];
    FORBIDDEN_PREFIXES.iter().any(|p| name.starts_with(p)) || FORBIDDEN.contains(&name)
}

struct WriteScriptTool {
    scripts: Arc<dyn ScriptStore>,
    state: SharedPlanState,
}

#[async_trait]
impl Tool for WriteScriptTool {
    fn name(&self) -> &str {
        "write_script"
    }

    fn description(&self) -> &str {
        "Save an analysis script under a name. Overwrites an existing script \
         with the same name. The script must define `def main(params)` and \
         return a JSON-serializable dict."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "File name for the script, e.g. 'volatility_top5.py'."
                },
                "content": {
                    "type": "string",
                    "description": "Full script source."
                }
            },
            "required": ["name", "content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let name = match input.get("name").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => return ToolResult::error("missing required parameter: name"),
        };
        let content = match input.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolResult::error("missing required parameter: content"),
        };

        if let Err(e) = self.scripts.write_script(&name, &content) {
            return ToolResult::error(format!("failed to write '{name}': {e}"));
        }

        let mut state = self.state.lock().unwrap();
        if !state.written.contains(&name) {
            state.written.push(name.clone());
        }
        // A rewrite invalidates any earlier validation pass.
        state.validated.remove(&name);

        ToolResult::success(format!("Script saved: {} bytes to '{name}'", content.len()))
    }
}

struct ReadScriptTool {
    scripts: Arc<dyn ScriptStore>,
}

#[async_trait]
impl Tool for ReadScriptTool {
    fn name(&self) -> &str {
        "read_script"
    }

    fn description(&self) -> &str {
        "Read a previously saved analysis script by name."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Script name to read." }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let name = match input.get("name").and_then(|v| v.as_str()) {
            Some(n) => n,
            None => return ToolResult::error("missing required parameter: name"),
        };
        match self.scripts.read_script(name) {
            Ok(content) => ToolResult::success(content),
            Err(e) => ToolResult::error(format!("failed to read '{name}': {e}")),
        }
    }
}

struct ValidateScriptTool {
    scripts: Arc<dyn ScriptStore>,
    state: SharedPlanState,
}

#[async_trait]
impl Tool for ValidateScriptTool {
    fn name(&self) -> &str {
        "validate_script"
    }

    fn description(&self) -> &str {
        "Validate a saved script: it must be non-empty, define `def main(params)`, \
         and not shadow the parameter binding. Validation must pass before the \
         script can be executed."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Script name to validate." }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let name = match input.get("name").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => return ToolResult::error("missing required parameter: name"),
        };
        let content = match self.scripts.read_script(&name) {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("failed to read '{name}': {e}")),
        };

        if let Err(problem) = validate_script_source(&content) {
            return ToolResult::error(format!("validation failed for '{name}': {problem}"));
        }

        self.state.lock().unwrap().validated.insert(name.clone());
        ToolResult::success(format!("Validation passed for '{name}'"))
    }
}

/// Static checks applied before a script is accepted for execution.
fn validate_script_source(content: &str) -> std::result::Result<(), String> {
    if content.trim().is_empty() {
        return Err("script is empty".to_string());
    }
    if !content.contains("def main(") {
        return Err("script must define `def main(params)`".to_string());
    }
    if content.contains("params =") {
        return Err("script must not rebind `params`".to_string());
    }
    Ok(())
}

struct LookupDocsTool;

#[async_trait]
impl Tool for LookupDocsTool {
    fn name(&self) -> &str {
        "lookup_docs"
    }

    fn description(&self) -> &str {
        "Look up the docstring of an analytics-library function available to \
         generated scripts."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "function": { "type": "string", "description": "Function name, e.g. 'rolling_volatility'." }
            },
            "required": ["function"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let function = match input.get("function").and_then(|v| v.as_str()) {
            Some(f) => f,
            None => return ToolResult::error("missing required parameter: function"),
        };
        match analytics_catalog().iter().find(|(name, _)| *name == function) {
            Some((_, doc)) => ToolResult::success(*doc),
            None => {
                let names: Vec<&str> = analytics_catalog().iter().map(|(n, _)| *n).collect();
                ToolResult::error(format!(
                    "unknown function '{function}'. Available: {}",
                    names.join(", ")
                ))
            }
        }
    }
}

/// Docstrings of the analytics functions generated scripts may import.
fn analytics_catalog() -> &'static [(&'static str, &'static str)] {
    &[
        (
            "rolling_volatility",
            "rolling_volatility(prices, window) -> Series. Annualized rolling standard \
             deviation of log returns over `window` periods.",
        ),
        (
            "rolling_returns",
            "rolling_returns(prices, window) -> Series. Rolling simple returns over \
             `window` periods.",
        ),
        (
            "correlation_matrix",
            "correlation_matrix(price_frame) -> DataFrame. Pairwise Pearson correlation \
             of the given price columns.",
        ),
        (
            "relative_strength",
            "relative_strength(prices, benchmark) -> Series. Price ratio of a symbol \
             against a benchmark, normalized to 1.0 at the window start.",
        ),
        (
            "max_drawdown",
            "max_drawdown(prices) -> float. Largest peak-to-trough decline over the \
             series, as a negative fraction.",
        ),
        (
            "sharpe_ratio",
            "sharpe_ratio(returns, risk_free_rate=0.0) -> float. Mean excess return \
             over its standard deviation, annualized.",
        ),
        (
            "fetch_prices",
            "fetch_prices(symbols, start, end, interval='1d') -> DataFrame. Daily OHLCV \
             bars from the market-data provider. Script-only: not callable as a \
             planning tool.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    /// In-memory script store for tool tests.
    pub(crate) struct MemScriptStore {
        files: Mutex<HashMap<String, String>>,
    }

    impl MemScriptStore {
        pub(crate) fn new() -> Self {
            Self {
                files: Mutex::new(HashMap::new()),
            }
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

    fn setup() -> (Vec<Box<dyn Tool>>, SharedPlanState) {
        let state: SharedPlanState = Arc::new(Mutex::new(PlanState::default()));
        let tools = planning_tools(Arc::new(MemScriptStore::new()), state.clone());
        (tools, state)
    }

    async fn call(tools: &[Box<dyn Tool>], name: &str, input: serde_json::Value) -> ToolResult {
        tools
            .iter()
            .find(|t| t.name() == name)
            .expect("tool exists")
            .execute(input)
            .await
    }

    #[tokio::test]
    async fn write_then_validate_tracks_state() {
        let (tools, state) = setup();
        let r = call(
            &tools,
            "write_script",
            serde_json::json!({"name": "vol.py", "content": "def main(params):\n    return {}\n"}),
        )
        .await;
        assert!(!r.is_error, "{}", r.content);

        let r = call(&tools, "validate_script", serde_json::json!({"name": "vol.py"})).await;
        assert!(!r.is_error, "{}", r.content);

        let s = state.lock().unwrap();
        assert_eq!(s.written, vec!["vol.py"]);
        assert!(s.validated.contains("vol.py"));
    }

    #[tokio::test]
    async fn rewrite_invalidates_prior_validation() {
        let (tools, state) = setup();
        call(
            &tools,
            "write_script",
            serde_json::json!({"name": "vol.py", "content": "def main(params):\n    return {}\n"}),
        )
        .await;
        call(&tools, "validate_script", serde_json::json!({"name": "vol.py"})).await;
        call(
            &tools,
            "write_script",
            serde_json::json!({"name": "vol.py", "content": "def main(params):\n    return {'v': 2}\n"}),
        )
        .await;
        assert!(!state.lock().unwrap().validated.contains("vol.py"));
    }

    #[tokio::test]
    async fn validation_rejects_missing_entrypoint() {
        let (tools, _state) = setup();
        call(
            &tools,
            "write_script",
            serde_json::json!({"name": "bad.py", "content": "print('hi')\n"}),
        )
        .await;
        let r = call(&tools, "validate_script", serde_json::json!({"name": "bad.py"})).await;
        assert!(r.is_error);
        assert!(r.content.contains("def main"));
    }

    #[tokio::test]
    async fn docs_lookup_knows_the_catalog() {
        let (tools, _state) = setup();
        let r = call(&tools, "lookup_docs", serde_json::json!({"function": "rolling_volatility"})).await;
        assert!(!r.is_error);
        assert!(r.content.contains("rolling standard"));

        let r = call(&tools, "lookup_docs", serde_json::json!({"function": "nope"})).await;
        assert!(r.is_error);
        assert!(r.content.contains("Available:"));
    }

    #[test]
    fn forbidden_tool_detection() {
        assert!(is_forbidden_tool("get_stock_prices"));
        assert!(is_forbidden_tool("compute_rsi"));
        assert!(is_forbidden_tool("run_analysis"));
        assert!(!is_forbidden_tool("write_script"));
        assert!(!is_forbidden_tool("lookup_docs"));
    }
}
