//! Read and administer broker contents.

use crate::broker::{Broker, QueueStats};
use crate::error::TaskResult;
use crate::task::{TaskId, TaskInfo, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Largest page returned by [`Inspector::list_tasks`].
pub const MAX_PAGE_SIZE: usize = 500;

/// Totals across every known queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardStats {
    /// Tasks held by the broker in any state.
    pub total_tasks: u64,

    pub total_pending: u64,
    pub total_active: u64,
    pub total_scheduled: u64,
    pub total_retry: u64,
    pub total_dead: u64,

    /// Completed tasks, all time.
    pub total_processed: u64,

    /// Failed attempts, all time.
    pub total_failed: u64,

    /// Per-queue statistics.
    pub queues: Vec<QueueStats>,

    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
}

/// Broker introspection used by the monitor.
#[derive(Clone)]
pub struct Inspector {
    broker: Arc<dyn Broker>,
    configured: Vec<String>,
}

impl Inspector {
    /// Creates an inspector. `configured` queues are always reported, even when empty.
    pub fn new(broker: Arc<dyn Broker>, configured: Vec<String>) -> Self {
        Self { broker, configured }
    }

    /// Configured queues plus any queue the broker has seen, sorted by name.
    pub async fn queues(&self) -> TaskResult<Vec<String>> {
        let mut names: BTreeSet<String> = self.configured.iter().cloned().collect();
        names.extend(self.broker.queues().await?);
        Ok(names.into_iter().collect())
    }

    /// Counters for one queue.
    pub async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats> {
        self.broker.queue_stats(queue).await
    }

    /// Totals across every queue.
    pub async fn dashboard(&self) -> TaskResult<DashboardStats> {
        let mut dashboard = DashboardStats {
            generated_at: Utc::now(),
            ..DashboardStats::default()
        };

        for queue in self.queues().await? {
            let stats = self.broker.queue_stats(&queue).await?;
            dashboard.total_tasks += stats.size;
            dashboard.total_pending += stats.pending;
            dashboard.total_active += stats.active;
            dashboard.total_scheduled += stats.scheduled;
            dashboard.total_retry += stats.retry;
            dashboard.total_dead += stats.dead;
            dashboard.total_processed += stats.processed;
            dashboard.total_failed += stats.failed;
            dashboard.queues.push(stats);
        }

        Ok(dashboard)
    }

    /// Page of tasks in `state`. `limit` is clamped to [`MAX_PAGE_SIZE`].
    pub async fn list_tasks(&self, queue: &str, state: TaskState, offset: usize, limit: usize) -> TaskResult<Vec<TaskInfo>> {
        let limit = limit.min(MAX_PAGE_SIZE);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.broker.list_tasks(queue, state, offset, limit).await
    }

    /// One task.
    pub async fn get_task(&self, queue: &str, id: &TaskId) -> TaskResult<TaskInfo> {
        self.broker.get_task(queue, id).await
    }

    /// Deletes a task that is not currently running.
    pub async fn delete_task(&self, queue: &str, id: &TaskId) -> TaskResult<()> {
        self.broker.delete_task(queue, id).await?;
        info!(queue, task_id = %id, "Deleted task");
        Ok(())
    }

    /// Makes a scheduled, retry or dead task pending immediately.
    pub async fn run_task(&self, queue: &str, id: &TaskId) -> TaskResult<TaskInfo> {
        self.broker.run_task(queue, id).await?;
        info!(queue, task_id = %id, "Task scheduled to run now");
        self.broker.get_task(queue, id).await
    }
}
