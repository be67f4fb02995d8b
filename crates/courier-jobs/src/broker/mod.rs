//! Broker abstraction over durable task storage.
//!
//! A broker stores task messages per queue and moves them between states:
//!
//! ```text
//!   enqueue ──► scheduled ──(forward)──► pending ──(dequeue)──► active ──► done
//!      │                                   ▲                      │
//!      └──────────────────────────────────►┤                      ├──► retry ──(forward)──┐
//!                                          │◄─────(recover)───────┤                       │
//!                                          │◄─────────────────────┼───────────────────────┘
//!                                          │                      └──► dead
//! ```
//!
//! Every transition is atomic inside the broker; callers never read-then-write.

mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use self::redis::{build_pool, create_pool, RedisBroker, RedisKeys};

use crate::error::TaskResult;
use crate::task::{TaskId, TaskInfo, TaskMessage, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum tasks moved by one forward or recover step per queue.
pub const MOVE_BATCH_SIZE: usize = 100;

/// Per-queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name.
    pub queue: String,
    /// Tasks in any state.
    pub size: u64,
    pub pending: u64,
    pub active: u64,
    pub scheduled: u64,
    pub retry: u64,
    pub dead: u64,
    /// Tasks completed successfully since the queue was created.
    pub processed: u64,
    /// Failed attempts since the queue was created.
    pub failed: u64,
}

impl QueueStats {
    /// Creates empty stats for a queue.
    pub fn empty(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    /// Count of tasks in `state`.
    pub fn count(&self, state: TaskState) -> u64 {
        match state {
            TaskState::Scheduled => self.scheduled,
            TaskState::Pending => self.pending,
            TaskState::Active => self.active,
            TaskState::Retry => self.retry,
            TaskState::Dead => self.dead,
        }
    }

    pub(crate) fn with_size(mut self) -> Self {
        self.size = self.pending + self.active + self.scheduled + self.retry + self.dead;
        self
    }
}

/// Durable task storage used by the client, the worker pool and the inspector.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Checks that the broker is reachable.
    async fn ping(&self) -> TaskResult<()>;

    /// Releases broker resources. Later calls fail with `Connection`.
    async fn close(&self) -> TaskResult<()>;

    /// Stores a new task.
    ///
    /// The task is `scheduled` if `process_at` is in the future and `pending`
    /// otherwise. If the message carries a uniqueness key, the key is claimed
    /// for its TTL in the same atomic step, failing with `DuplicateTask` when
    /// already held. An ID already present in the queue fails with
    /// `TaskIdConflict`.
    async fn enqueue(&self, msg: &TaskMessage) -> TaskResult<TaskState>;

    /// Leases the oldest pending task of the first non-empty queue in `queues`.
    ///
    /// The lease expires at `now + task timeout + lease_grace`.
    async fn dequeue(&self, queues: &[String], lease_grace: Duration) -> TaskResult<Option<TaskMessage>>;

    /// Removes a completed task and releases its uniqueness key.
    async fn done(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Moves a leased task to the retry set; `msg` carries the updated retry count.
    async fn retry(&self, msg: &TaskMessage, retry_at: DateTime<Utc>) -> TaskResult<()>;

    /// Moves a leased task to the dead set.
    async fn archive(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Returns a leased task to the front of its pending queue without consuming a retry.
    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Moves due scheduled and retry tasks to pending. Returns the number moved.
    async fn forward(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64>;

    /// Returns tasks whose lease expired before `now` to pending. Returns the number moved.
    async fn recover(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64>;

    /// Names of every queue that has ever held a task.
    async fn queues(&self) -> TaskResult<Vec<String>>;

    /// Counters for one queue.
    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats>;

    /// Tasks of `queue` in `state`, oldest first.
    async fn list_tasks(&self, queue: &str, state: TaskState, offset: usize, limit: usize) -> TaskResult<Vec<TaskInfo>>;

    /// One task, or `NotFound`.
    async fn get_task(&self, queue: &str, id: &TaskId) -> TaskResult<TaskInfo>;

    /// Deletes a task that is not active.
    async fn delete_task(&self, queue: &str, id: &TaskId) -> TaskResult<()>;

    /// Moves a scheduled, retry or dead task to pending now, resetting its retry count.
    async fn run_task(&self, queue: &str, id: &TaskId) -> TaskResult<()>;
}
