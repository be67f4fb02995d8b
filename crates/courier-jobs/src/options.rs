//! Per-enqueue options and the defaults they override.

use crate::error::{TaskError, TaskResult};
use crate::task::{Task, TaskId, TaskMessage};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use courier_config::AppConfig;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Values applied when an enqueue call does not override them.
#[derive(Debug, Clone)]
pub struct TaskDefaults {
    /// Queue name.
    pub queue: String,
    /// Maximum retries.
    pub max_retry: u32,
    /// Handler timeout.
    pub timeout: Duration,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for TaskDefaults {
    fn from(config: &AppConfig) -> Self {
        Self {
            queue: config.queues.default_queue.clone(),
            max_retry: config.retry.default_max_retry,
            timeout: config.retry.default_timeout(),
        }
    }
}

/// Builder for enqueue options.
///
/// ```rust,ignore
/// let opts = EnqueueOptions::new()
///     .queue("critical")
///     .max_retry(5)
///     .process_in(Duration::from_secs(60))
///     .unique(Duration::from_secs(3600));
/// client.enqueue(task, opts).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    queue: Option<String>,
    max_retry: Option<u32>,
    timeout: Option<Duration>,
    process_at: Option<DateTime<Utc>>,
    process_in: Option<Duration>,
    unique_ttl: Option<Duration>,
    unique_key: Option<String>,
    task_id: Option<TaskId>,
}

impl EnqueueOptions {
    /// Creates empty options; every value falls back to the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the maximum number of retries.
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Set the handler timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Schedule for a specific time.
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self.process_in = None;
        self
    }

    /// Set a delay before processing.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self.process_at = None;
        self
    }

    /// Reject duplicates of this task for `ttl`.
    ///
    /// The key is derived from queue, type and payload unless
    /// [`unique_key`](Self::unique_key) supplies one.
    pub fn unique(mut self, ttl: Duration) -> Self {
        self.unique_ttl = Some(ttl);
        self
    }

    /// Reject duplicates sharing `key` for `ttl`.
    pub fn unique_key(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.unique_key = Some(key.into());
        self.unique_ttl = Some(ttl);
        self
    }

    /// Use an explicit task ID instead of a generated one.
    pub fn task_id(mut self, id: impl Into<TaskId>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    /// Returns the uniqueness TTL, if any.
    pub fn unique_ttl(&self) -> Option<Duration> {
        self.unique_ttl
    }

    /// Builds the broker message for `task`.
    pub fn build(self, task: &Task, defaults: &TaskDefaults, now: DateTime<Utc>) -> TaskResult<TaskMessage> {
        if task.type_name().trim().is_empty() {
            return Err(TaskError::InvalidTask("task type name is empty".to_string()));
        }

        let queue = self.queue.unwrap_or_else(|| defaults.queue.clone());
        if queue.trim().is_empty() {
            return Err(TaskError::InvalidTask("queue name is empty".to_string()));
        }

        let timeout = self.timeout.unwrap_or(defaults.timeout);
        if timeout.as_secs() == 0 {
            return Err(TaskError::InvalidTask(
                "timeout must be at least one second".to_string(),
            ));
        }
        checked_after(now, timeout, "timeout")?;

        let process_at = match (self.process_at, self.process_in) {
            (Some(at), _) => at,
            (None, Some(delay)) => checked_after(now, delay, "delay")?,
            (None, None) => now,
        };

        let (unique_key, unique_ttl_secs) = match self.unique_ttl {
            Some(ttl) if ttl.as_secs() == 0 => {
                return Err(TaskError::InvalidTask(
                    "uniqueness TTL must be at least one second".to_string(),
                ));
            }
            Some(ttl) => {
                checked_after(now, ttl, "uniqueness TTL")?;
                let key = self
                    .unique_key
                    .unwrap_or_else(|| derive_unique_key(&queue, task.type_name(), task.payload()));
                (Some(key), Some(ttl.as_secs()))
            }
            None => (None, None),
        };

        Ok(TaskMessage {
            id: self.task_id.unwrap_or_default(),
            type_name: task.type_name().to_string(),
            payload: task.payload().to_vec(),
            queue,
            max_retry: self.max_retry.unwrap_or(defaults.max_retry),
            retried: 0,
            timeout_secs: timeout.as_secs(),
            unique_key,
            unique_ttl_secs,
            last_error: None,
            last_failed_at: None,
            enqueued_at: now,
            process_at,
        })
    }
}

/// Uniqueness key for a task: queue, type and a SHA-256 of the payload.
pub fn derive_unique_key(queue: &str, type_name: &str, payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    format!("{}:{}:{}", queue, type_name, hex::encode(digest))
}

fn checked_after(now: DateTime<Utc>, delay: Duration, what: &str) -> TaskResult<DateTime<Utc>> {
    ChronoDuration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| TaskError::InvalidTask(format!("{what} out of range: {delay:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> TaskDefaults {
        TaskDefaults {
            queue: "default".to_string(),
            max_retry: 25,
            timeout: Duration::from_secs(1800),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let now = Utc::now();
        let msg = EnqueueOptions::new()
            .build(&Task::new("email:send", "{}"), &defaults(), now)
            .unwrap();
        assert_eq!(msg.queue, "default");
        assert_eq!(msg.max_retry, 25);
        assert_eq!(msg.timeout_secs, 1800);
        assert_eq!(msg.process_at, now);
        assert!(msg.unique_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let now = Utc::now();
        let msg = EnqueueOptions::new()
            .queue("critical")
            .max_retry(2)
            .timeout(Duration::from_secs(5))
            .process_in(Duration::from_secs(60))
            .task_id("fixed-id")
            .build(&Task::new("email:send", "{}"), &defaults(), now)
            .unwrap();
        assert_eq!(msg.queue, "critical");
        assert_eq!(msg.max_retry, 2);
        assert_eq!(msg.timeout_secs, 5);
        assert_eq!(msg.process_at, now + ChronoDuration::seconds(60));
        assert_eq!(msg.id.as_str(), "fixed-id");
    }

    #[test]
    fn test_empty_type_rejected() {
        let err = EnqueueOptions::new()
            .build(&Task::new("  ", "{}"), &defaults(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = EnqueueOptions::new()
            .timeout(Duration::from_millis(200))
            .build(&Task::new("email:send", "{}"), &defaults(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let task = Task::new("email:send", "{}");
        let huge = Duration::from_secs(10_000_000_000_000);

        for options in [
            EnqueueOptions::new().timeout(huge),
            EnqueueOptions::new().timeout(Duration::from_secs(u64::MAX)),
            EnqueueOptions::new().process_in(huge),
            EnqueueOptions::new().unique(huge),
        ] {
            let err = options.build(&task, &defaults(), Utc::now()).unwrap_err();
            assert!(matches!(err, TaskError::InvalidTask(ref m) if m.contains("out of range")), "{err}");
        }
    }

    #[test]
    fn test_unique_key_derived_from_payload() {
        let task = Task::new("email:send", "{\"to\":\"a\"}");
        let a = EnqueueOptions::new()
            .unique(Duration::from_secs(60))
            .build(&task, &defaults(), Utc::now())
            .unwrap();
        let b = EnqueueOptions::new()
            .unique(Duration::from_secs(60))
            .build(&Task::new("email:send", "{\"to\":\"b\"}"), &defaults(), Utc::now())
            .unwrap();

        let key = a.unique_key.unwrap();
        assert!(key.starts_with("default:email:send:"));
        assert_eq!(key.len(), "default:email:send:".len() + 64);
        assert_ne!(Some(key), b.unique_key);
        assert_eq!(a.unique_ttl_secs, Some(60));
    }

    #[test]
    fn test_explicit_unique_key() {
        let msg = EnqueueOptions::new()
            .unique_key("welcome:42", Duration::from_secs(10))
            .build(&Task::new("email:send", "{}"), &defaults(), Utc::now())
            .unwrap();
        assert_eq!(msg.unique_key.as_deref(), Some("welcome:42"));
    }
}
