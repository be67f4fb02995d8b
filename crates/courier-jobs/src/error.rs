//! Task error types.

use thiserror::Error;

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Task-related errors.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The broker could not be reached or was closed.
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// A task with the same uniqueness key is still live.
    #[error("Duplicate task: unique key {0} is held")]
    DuplicateTask(String),

    /// An explicit task ID is already present in the queue.
    #[error("Task ID conflict: {0} already exists")]
    TaskIdConflict(String),

    /// Handler reported a failure; the task is retried if budget remains.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Handler reported a failure that must not be retried.
    #[error("Handler failed permanently: {0}")]
    SkipRetry(String),

    /// Handler did not finish within the task timeout.
    #[error("Task timed out after {0} seconds")]
    Timeout(u64),

    /// Configuration is invalid; the pool cannot start.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Task rejected before reaching the broker.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the task's current state.
    #[error("Invalid task state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Creates a retryable handler error.
    pub fn handler(msg: impl Into<String>) -> Self {
        TaskError::Handler(msg.into())
    }

    /// Creates a handler error that sends the task straight to the dead set.
    pub fn skip_retry(msg: impl Into<String>) -> Self {
        TaskError::SkipRetry(msg.into())
    }

    /// Returns true if a failed task may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TaskError::SkipRetry(_) | TaskError::Configuration(_) | TaskError::InvalidTask(_)
        )
    }

    /// Returns true if the error means the broker is unreachable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TaskError::Connection(_) | TaskError::Redis(_) | TaskError::Pool(_)
        )
    }

    /// Short stable label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Connection(_) | TaskError::Redis(_) | TaskError::Pool(_) => "connection",
            TaskError::DuplicateTask(_) => "duplicate",
            TaskError::TaskIdConflict(_) => "id_conflict",
            TaskError::Handler(_) => "handler",
            TaskError::SkipRetry(_) => "skip_retry",
            TaskError::Timeout(_) => "timeout",
            TaskError::Configuration(_) => "configuration",
            TaskError::InvalidTask(_) => "invalid_task",
            TaskError::NotFound(_) => "not_found",
            TaskError::InvalidState { .. } => "invalid_state",
            TaskError::Serialization(_) => "serialization",
            TaskError::Internal(_) => "internal",
        }
    }
}

impl From<courier_config::ConfigError> for TaskError {
    fn from(err: courier_config::ConfigError) -> Self {
        TaskError::Configuration(err.to_string())
    }
}
