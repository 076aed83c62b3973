use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Result of one sandboxed script run, as reported by the collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxOutcome {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Collaborator-measured wall time in seconds.
    #[serde(default)]
    pub execution_time: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("Sandbox API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Script execution timeout after {seconds}s")]
    Timeout { seconds: u64 },
}

/// The external script runner, behind a trait so tests script the results.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        script: &str,
        parameters: &Map<String, Value>,
        timeout_seconds: u64,
    ) -> Result<SandboxOutcome, SandboxError>;
}

/// POST /execute client for the sandbox collaborator.
pub struct HttpSandbox {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSandbox {
    /// `base_url` should NOT include a trailing slash.
    pub fn new(base_url: String, connect_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .unwrap_or_default(),
            base_url,
        }
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    async fn execute(
        &self,
        script: &str,
        parameters: &Map<String, Value>,
        timeout_seconds: u64,
    ) -> Result<SandboxOutcome, SandboxError> {
        let url = format!("{}/execute", self.base_url);
        debug!(timeout_seconds, "posting script to sandbox");

        // Give the collaborator a grace margin over the script's own budget
        // so its structured timeout error wins over a transport cutoff.
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(timeout_seconds + 10))
            .json(&serde_json::json!({
                "script": script,
                "parameters": parameters,
                "timeout_seconds": timeout_seconds,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SandboxError::Timeout {
                        seconds: timeout_seconds,
                    }
                } else {
                    SandboxError::Http(e)
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "sandbox returned an error status");
            return Err(SandboxError::Api {
                status,
                message: text,
            });
        }

        resp.json::<SandboxOutcome>().await.map_err(SandboxError::Http)
    }
}
