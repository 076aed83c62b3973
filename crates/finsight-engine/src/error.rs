use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] finsight_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] finsight_queue::QueueError),

    #[error("Dialogue error: {0}")]
    Dialogue(#[from] finsight_dialogue::DialogueError),

    #[error("LLM provider error: {0}")]
    Llm(#[from] finsight_llm::ProviderError),

    #[error("Vector index error: {0}")]
    Index(#[from] finsight_index::IndexError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
