//! Error types for AI Tasks.

use std::time::Duration;

/// Top-level error type for the task service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt record {task_id}: {reason}")]
    Corrupt { task_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stream transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command {command} failed on {stream}: {reason}")]
    Command {
        command: &'static str,
        stream: String,
        reason: String,
    },

    #[error("Malformed delivery {entry_id} on {stream}: {reason}")]
    Malformed {
        stream: String,
        entry_id: String,
        reason: String,
    },

    #[error("Transport closed")]
    Closed,
}

/// Submission and dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Errors raised while a worker runs a task.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Task {task_id} is already {status}")]
    AlreadyTerminal { task_id: String, status: String },

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Collector(#[from] CollectorError),

    #[error("language model returned no response")]
    NoModelResponse,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// Profile metrics collector errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("GitHub rate limit exceeded. Retry after {retry_after_seconds} seconds.")]
    RateLimited {
        retry_after_seconds: u64,
        reset_at: Option<i64>,
    },

    #[error("GitHub request failed: {0}")]
    Http(String),

    #[error("Mock features unavailable: {0}")]
    Mock(String),
}

/// Web search errors.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} returned status {status}")]
    Status { provider: String, status: u16 },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether the request is worth repeating after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::RateLimited { .. } => true,
            Self::Status { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            Self::InvalidResponse { .. } | Self::Json(_) => true,
        }
    }
}

/// Result type alias for the task service.
pub type Result<T> = std::result::Result<T, Error>;
