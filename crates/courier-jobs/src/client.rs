//! Enqueue client.

use crate::broker::Broker;
use crate::error::TaskResult;
use crate::metrics::TaskMetrics;
use crate::options::{EnqueueOptions, TaskDefaults};
use crate::task::{Task, TaskInfo};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Submits tasks to the broker.
///
/// The client only writes to the broker; it never starts a worker pool and
/// can be used from processes that do not process tasks at all.
#[derive(Clone)]
pub struct Client {
    broker: Arc<dyn Broker>,
    defaults: TaskDefaults,
}

impl Client {
    /// Creates a client over `broker`.
    pub fn new(broker: Arc<dyn Broker>, defaults: TaskDefaults) -> Self {
        Self { broker, defaults }
    }

    /// Enqueue a task with options.
    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> TaskResult<TaskInfo> {
        let msg = opts.build(&task, &self.defaults, Utc::now())?;
        let state = self.broker.enqueue(&msg).await?;

        TaskMetrics::task_enqueued(&msg.queue, &msg.type_name);
        debug!(
            task_id = %msg.id,
            task_type = %msg.type_name,
            queue = %msg.queue,
            state = %state,
            "Enqueued task"
        );

        Ok(TaskInfo::from_message(&msg, state, Some(msg.process_at)))
    }

    /// Enqueue a task to be processed after `delay`.
    pub async fn enqueue_in(&self, task: Task, delay: Duration) -> TaskResult<TaskInfo> {
        self.enqueue(task, EnqueueOptions::new().process_in(delay)).await
    }

    /// Enqueue a task to be processed at `at`.
    pub async fn enqueue_at(&self, task: Task, at: DateTime<Utc>) -> TaskResult<TaskInfo> {
        self.enqueue(task, EnqueueOptions::new().process_at(at)).await
    }

    /// Enqueue a task unless an identical one was enqueued within `ttl`.
    ///
    /// Identity is queue, type and payload. Fails with `DuplicateTask` on conflict.
    pub async fn enqueue_unique(&self, task: Task, ttl: Duration) -> TaskResult<TaskInfo> {
        self.enqueue(task, EnqueueOptions::new().unique(ttl)).await
    }

    /// Defaults applied to every enqueue.
    pub fn defaults(&self) -> &TaskDefaults {
        &self.defaults
    }
}
