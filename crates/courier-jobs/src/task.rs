//! Task definitions and the serialized message stored in the broker.

use crate::error::{TaskError, TaskResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a task ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the task ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A unit of work: a type name routed to a handler plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    type_name: String,
    payload: Vec<u8>,
}

impl Task {
    /// Creates a task with a raw payload.
    pub fn new(type_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            payload: payload.into(),
        }
    }

    /// Creates a task whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(type_name: impl Into<String>, value: &T) -> TaskResult<Self> {
        Ok(Self::new(type_name, serde_json::to_vec(value)?))
    }

    /// Task type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decodes the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> TaskResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Where a task currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for its process time.
    Scheduled,
    /// Ready to be leased.
    Pending,
    /// Leased by a worker slot.
    Active,
    /// Failed, waiting for its backoff to elapse.
    Retry,
    /// Retry budget exhausted; kept for inspection.
    Dead,
}

impl TaskState {
    /// All states, in lifecycle order.
    pub const ALL: [TaskState; 5] = [
        TaskState::Scheduled,
        TaskState::Pending,
        TaskState::Active,
        TaskState::Retry,
        TaskState::Dead,
    ];

    /// Returns the lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduled => "scheduled",
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Dead => "dead",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TaskError::InvalidTask(format!("unknown task state: {s}")))
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Serialized task as stored in the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task ID.
    pub id: TaskId,

    /// Task type name.
    #[serde(rename = "type")]
    pub type_name: String,

    /// Opaque payload, base64 on the wire.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,

    /// Queue name.
    pub queue: String,

    /// Maximum number of retries after the first attempt.
    pub max_retry: u32,

    /// Number of retries already consumed.
    pub retried: u32,

    /// Handler timeout in seconds.
    pub timeout_secs: u64,

    /// Uniqueness key, held until the task completes or the TTL expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,

    /// Uniqueness TTL in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_ttl_secs: Option<u64>,

    /// Error from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// When the last attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,

    /// When the task was enqueued.
    pub enqueued_at: DateTime<Utc>,

    /// When the task becomes eligible for processing.
    pub process_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Serializes to JSON.
    pub fn to_json(&self) -> TaskResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes from JSON.
    pub fn from_json(json: &str) -> TaskResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the handler timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the task view handed to handlers.
    pub fn task(&self) -> Task {
        Task::new(self.type_name.clone(), self.payload.clone())
    }

    /// Returns true if the retry budget is exhausted.
    pub fn retry_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }

    /// Records a failed attempt.
    pub fn record_failure(&mut self, error: &TaskError, at: DateTime<Utc>) {
        self.last_error = Some(error.to_string());
        self.last_failed_at = Some(at);
    }
}

/// Read-only snapshot of a task and its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub queue: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Payload as UTF-8 when it is valid text, base64 otherwise.
    pub payload: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub retried: u32,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    /// Next time the task will be processed; `None` for active and dead tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_process_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// Builds a snapshot from a stored message.
    pub fn from_message(msg: &TaskMessage, state: TaskState, next_process_at: Option<DateTime<Utc>>) -> Self {
        let payload = match std::str::from_utf8(&msg.payload) {
            Ok(text) => text.to_string(),
            Err(_) => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(&msg.payload)
            }
        };

        Self {
            id: msg.id.clone(),
            queue: msg.queue.clone(),
            type_name: msg.type_name.clone(),
            payload,
            state,
            max_retry: msg.max_retry,
            retried: msg.retried,
            timeout_secs: msg.timeout_secs,
            unique_key: msg.unique_key.clone(),
            last_error: msg.last_error.clone(),
            last_failed_at: msg.last_failed_at,
            enqueued_at: msg.enqueued_at,
            next_process_at,
        }
    }
}

/// Execution context handed to a handler.
///
/// The cancellation token fires when the task times out or when shutdown
/// exceeds its grace period. Handlers doing long work should observe it.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task ID.
    pub task_id: TaskId,

    /// Task type name.
    pub task_type: String,

    /// Queue the task was leased from.
    pub queue: String,

    /// Retries consumed before this attempt.
    pub retried: u32,

    /// Maximum retries.
    pub max_retry: u32,

    /// When this attempt times out.
    pub deadline: DateTime<Utc>,

    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(msg: &TaskMessage, deadline: DateTime<Utc>, cancel: CancellationToken) -> Self {
        Self {
            task_id: msg.id.clone(),
            task_type: msg.type_name.clone(),
            queue: msg.queue.clone(),
            retried: msg.retried,
            max_retry: msg.max_retry,
            deadline,
            cancel,
        }
    }

    /// Returns true if this is the last attempt before the task goes dead.
    pub fn is_last_attempt(&self) -> bool {
        self.retried >= self.max_retry
    }

    /// Returns true once the attempt has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the attempt is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// `now + delay`, clamped to the latest representable instant.
pub(crate) fn saturating_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
