//! Common test infrastructure for worker pool and lifecycle tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_config::AppConfig;
use courier_jobs::broker::{Broker, MemoryBroker, QueueStats};
use courier_jobs::{TaskId, TaskInfo, TaskMessage, TaskResult, TaskState};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration with short intervals and no signal handling.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.concurrency = 2;
    config.worker.poll_interval_ms = 10;
    config.worker.forward_interval_ms = 20;
    config.worker.recover_interval_ms = 50;
    config.worker.shutdown_timeout_secs = 2;
    config.worker.handle_signals = false;
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config.retry.jitter_factor = 0.0;
    config
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Memory broker that counts calls and survives `close` so tests can
/// inspect it after shutdown.
#[derive(Default)]
pub struct CountingBroker {
    inner: MemoryBroker,
    pings: AtomicUsize,
    leases: AtomicUsize,
    closes: AtomicUsize,
    requeues: AtomicUsize,
}

impl CountingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn requeues(&self) -> usize {
        self.requeues.load(Ordering::SeqCst)
    }

    pub fn memory(&self) -> &MemoryBroker {
        &self.inner
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn ping(&self) -> TaskResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which concurrent starters would race.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.ping().await
    }

    async fn close(&self) -> TaskResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enqueue(&self, msg: &TaskMessage) -> TaskResult<TaskState> {
        self.inner.enqueue(msg).await
    }

    async fn dequeue(&self, queues: &[String], lease_grace: Duration) -> TaskResult<Option<TaskMessage>> {
        let leased = self.inner.dequeue(queues, lease_grace).await?;
        if leased.is_some() {
            self.leases.fetch_add(1, Ordering::SeqCst);
        }
        Ok(leased)
    }

    async fn done(&self, msg: &TaskMessage) -> TaskResult<()> {
        self.inner.done(msg).await
    }

    async fn retry(&self, msg: &TaskMessage, retry_at: DateTime<Utc>) -> TaskResult<()> {
        self.inner.retry(msg, retry_at).await
    }

    async fn archive(&self, msg: &TaskMessage) -> TaskResult<()> {
        self.inner.archive(msg).await
    }

    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()> {
        self.requeues.fetch_add(1, Ordering::SeqCst);
        self.inner.requeue(msg).await
    }

    async fn forward(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64> {
        self.inner.forward(queues, now).await
    }

    async fn recover(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64> {
        self.inner.recover(queues, now).await
    }

    async fn queues(&self) -> TaskResult<Vec<String>> {
        self.inner.queues().await
    }

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats> {
        self.inner.queue_stats(queue).await
    }

    async fn list_tasks(&self, queue: &str, state: TaskState, offset: usize, limit: usize) -> TaskResult<Vec<TaskInfo>> {
        self.inner.list_tasks(queue, state, offset, limit).await
    }

    async fn get_task(&self, queue: &str, id: &TaskId) -> TaskResult<TaskInfo> {
        self.inner.get_task(queue, id).await
    }

    async fn delete_task(&self, queue: &str, id: &TaskId) -> TaskResult<()> {
        self.inner.delete_task(queue, id).await
    }

    async fn run_task(&self, queue: &str, id: &TaskId) -> TaskResult<()> {
        self.inner.run_task(queue, id).await
    }
}
