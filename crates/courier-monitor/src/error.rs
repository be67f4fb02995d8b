//! Error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_jobs::TaskError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Monitor endpoint error.
#[derive(Debug)]
pub enum MonitorError {
    /// Mutation attempted in readonly mode.
    ReadOnly,
    /// Malformed request parameter.
    BadRequest(String),
    /// Error from the task system.
    Task(TaskError),
}

impl From<TaskError> for MonitorError {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

impl MonitorError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::ReadOnly => (StatusCode::FORBIDDEN, "READ_ONLY"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Task(err) => match err {
                TaskError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                TaskError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
                TaskError::InvalidTask(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
                e if e.is_connection_error() => (StatusCode::SERVICE_UNAVAILABLE, "BROKER_UNAVAILABLE"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match self {
            Self::ReadOnly => "Monitor is read-only".to_string(),
            Self::BadRequest(message) => message,
            Self::Task(err) => {
                if status.is_server_error() {
                    error!(error = %err, "Monitor request failed");
                }
                err.to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Result type for monitor handlers.
pub type MonitorResult<T> = Result<Json<T>, MonitorError>;
