use thiserror::Error;

#[derive(Debug, Error)]
pub enum FinsightError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("LLM provider error: {0}")]
    Llm(String),

    #[error("Vector index error: {0}")]
    Index(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FinsightError {
    /// Short error code string included in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FinsightError::Config(_) => "CONFIG_ERROR",
            FinsightError::Database(_) => "DATABASE_ERROR",
            FinsightError::Queue(_) => "QUEUE_ERROR",
            FinsightError::Llm(_) => "LLM_PROVIDER_ERROR",
            FinsightError::Index(_) => "INDEX_ERROR",
            FinsightError::Sandbox(_) => "SANDBOX_ERROR",
            FinsightError::NotFound { .. } => "NOT_FOUND",
            FinsightError::Serialization(_) => "SERIALIZATION_ERROR",
            FinsightError::Io(_) => "IO_ERROR",
            FinsightError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, FinsightError>;
