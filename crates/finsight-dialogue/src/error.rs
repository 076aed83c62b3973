use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialogueError {
    #[error("Store error: {0}")]
    Store(#[from] finsight_store::StoreError),

    #[error("LLM provider error: {0}")]
    Llm(#[from] finsight_llm::ProviderError),

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, DialogueError>;
