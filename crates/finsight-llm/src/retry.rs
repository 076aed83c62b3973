use std::time::Duration;

use tracing::warn;

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};

/// Send with exponential backoff on transient failures.
///
/// Retries HTTP transport errors, 5xx responses, rate limits (honoring the
/// server's retry-after when present) and unavailability. Parse errors and
/// 4xx responses surface immediately — retrying cannot fix the request.
pub async fn send_with_retry(
    provider: &dyn LlmProvider,
    req: &ChatRequest,
    max_retries: u32,
    base_delay: Duration,
) -> Result<ChatResponse, ProviderError> {
    let mut attempt = 0u32;
    loop {
        match provider.send(req).await {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = match &e {
                    ProviderError::RateLimited { retry_after_ms } => {
                        Duration::from_millis(*retry_after_ms)
                    }
                    _ => base_delay * 2u32.saturating_pow(attempt),
                };
                warn!(
                    provider = provider.name(),
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient LLM failure, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
