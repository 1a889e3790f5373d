//! Error types for Daigent.

use uuid::Uuid;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Background scheduler errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The handle was never issued, or its result was already consumed or cancelled.
    #[error("Scheduled unit {id} not found")]
    NotFound { id: Uuid },

    #[error("Scheduled unit {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Scheduler is shut down")]
    ShutDown,

    #[error("Scheduler failed to start: {0}")]
    Startup(String),
}

/// Persistence errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// LLM provider errors. Delivered to consumers as error chunks, never retried.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tool execution errors. Recorded on the tool message, surfaced to the model.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),
}

/// Registry and runtime errors, local to the requesting call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: i64 },

    #[error("Task {id} is already running")]
    Busy { id: i64 },

    #[error("Task {id} has no pending tool call {call_id}")]
    NoPendingTool { id: i64, call_id: String },

    #[error("Failed to resolve context for task {id}: {source}")]
    Context { id: i64, source: StoreError },

    #[error("Failed to create LLM client for task {id}: {reason}")]
    Client { id: i64, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Failed to spawn drive thread: {0}")]
    Spawn(String),
}

impl TaskError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Context { source, .. } | Self::Store(source) => source.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
