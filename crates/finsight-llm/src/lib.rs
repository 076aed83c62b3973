pub mod json;
pub mod openai;
pub mod provider;
pub mod retry;

pub use json::extract_json;
pub use openai::OpenAiProvider;
pub use provider::{
    ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role, ToolCall, ToolDefinition,
};
pub use retry::send_with_retry;
