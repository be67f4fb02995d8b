//! Redis broker implementation.

use super::scripts::Scripts;
use super::{build_pool, create_pool, RedisKeys};
use crate::broker::{Broker, QueueStats, MOVE_BATCH_SIZE};
use crate::error::{TaskError, TaskResult};
use crate::task::{TaskId, TaskInfo, TaskMessage, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_config::RedisConfig;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

/// Redis-backed broker.
///
/// All transitions run as Lua scripts so that each one is atomic on the
/// server. Connections come from a shared deadpool pool.
pub struct RedisBroker {
    pool: Pool,
    keys: RedisKeys,
    scripts: Scripts,
}

impl RedisBroker {
    /// Create a broker over an existing pool.
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            scripts: Scripts::new(),
        }
    }

    /// Create the pool from configuration and connect.
    pub async fn connect(config: &RedisConfig) -> TaskResult<Self> {
        let pool = create_pool(config).await?;
        Ok(Self::new(pool, config.key_prefix.clone()))
    }

    /// Create the pool from configuration without connecting.
    ///
    /// The first [`Broker::ping`] or operation opens a connection.
    pub fn from_config(config: &RedisConfig) -> TaskResult<Self> {
        let pool = build_pool(config)?;
        Ok(Self::new(pool, config.key_prefix.clone()))
    }

    /// Key builder used by this broker.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    async fn conn(&self) -> TaskResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn state_key(&self, queue: &str, state: TaskState) -> String {
        match state {
            TaskState::Scheduled => self.keys.scheduled(queue),
            TaskState::Pending => self.keys.pending(queue),
            TaskState::Active => self.keys.lease(queue),
            TaskState::Retry => self.keys.retry(queue),
            TaskState::Dead => self.keys.dead(queue),
        }
    }

    fn lease_lost(msg: &TaskMessage) -> TaskError {
        TaskError::InvalidState {
            expected: TaskState::Active.to_string(),
            actual: format!("lease on {} no longer held", msg.id),
        }
    }

    async fn fail(&self, msg: &TaskMessage, state: TaskState, score: DateTime<Utc>) -> TaskResult<()> {
        let mut conn = self.conn().await?;
        let moved: i64 = self
            .scripts
            .fail
            .key(self.keys.lease(&msg.queue))
            .key(self.keys.task(&msg.queue, msg.id.as_str()))
            .key(self.state_key(&msg.queue, state))
            .key(self.keys.failed(&msg.queue))
            .arg(msg.id.as_str())
            .arg(msg.to_json()?)
            .arg(score.timestamp_millis())
            .arg(state.as_str())
            .invoke_async(&mut *conn)
            .await?;

        if moved == 0 {
            return Err(Self::lease_lost(msg));
        }
        Ok(())
    }

    async fn move_due(&self, conn: &mut deadpool_redis::Connection, queue: &str, source: String, now: DateTime<Utc>) -> TaskResult<u64> {
        let moved: u64 = self
            .scripts
            .move_due
            .key(source)
            .key(self.keys.pending(queue))
            .arg(self.keys.task_prefix(queue))
            .arg(now.timestamp_millis())
            .arg(MOVE_BATCH_SIZE)
            .invoke_async(&mut **conn)
            .await?;
        Ok(moved)
    }

    async fn load(&self, conn: &mut deadpool_redis::Connection, queue: &str, id: &str) -> TaskResult<Option<(TaskState, TaskMessage)>> {
        let (state, msg): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.keys.task(queue, id))
            .arg("state")
            .arg("msg")
            .query_async(&mut **conn)
            .await?;

        match (state, msg) {
            (Some(state), Some(msg)) => Ok(Some((state.parse()?, TaskMessage::from_json(&msg)?))),
            _ => Ok(None),
        }
    }
}

fn from_millis(ms: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms as i64)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> TaskResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }

    async fn close(&self) -> TaskResult<()> {
        self.pool.close();
        info!("Redis broker closed");
        Ok(())
    }

    async fn enqueue(&self, msg: &TaskMessage) -> TaskResult<TaskState> {
        let state = if msg.process_at > Utc::now() {
            TaskState::Scheduled
        } else {
            TaskState::Pending
        };

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.keys.task(&msg.queue, msg.id.as_str()))
            .key(self.state_key(&msg.queue, state))
            .key(self.keys.queues())
            .arg(msg.to_json()?)
            .arg(msg.id.as_str())
            .arg(state.as_str())
            .arg(msg.process_at.timestamp_millis())
            .arg(msg.unique_ttl_secs.unwrap_or(0))
            .arg(&msg.queue);
        if let Some(unique_key) = &msg.unique_key {
            invocation.key(self.keys.unique(unique_key));
        }

        let mut conn = self.conn().await?;
        let result: i64 = invocation.invoke_async(&mut *conn).await?;

        match result {
            1 => {
                debug!(task_id = %msg.id, queue = %msg.queue, state = %state, "Stored task");
                Ok(state)
            }
            0 => Err(TaskError::TaskIdConflict(msg.id.to_string())),
            _ => Err(TaskError::DuplicateTask(
                msg.unique_key.clone().unwrap_or_default(),
            )),
        }
    }

    async fn dequeue(&self, queues: &[String], lease_grace: Duration) -> TaskResult<Option<TaskMessage>> {
        let mut conn = self.conn().await?;
        let grace_ms = u64::try_from(lease_grace.as_millis()).unwrap_or(u64::MAX);

        for queue in queues {
            let leased: Option<String> = self
                .scripts
                .dequeue
                .key(self.keys.pending(queue))
                .key(self.keys.lease(queue))
                .arg(self.keys.task_prefix(queue))
                .arg(Utc::now().timestamp_millis())
                .arg(grace_ms)
                .invoke_async(&mut *conn)
                .await?;

            if let Some(json) = leased {
                return TaskMessage::from_json(&json).map(Some);
            }
        }

        Ok(None)
    }

    async fn done(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut invocation = self.scripts.done.prepare_invoke();
        invocation
            .key(self.keys.lease(&msg.queue))
            .key(self.keys.task(&msg.queue, msg.id.as_str()))
            .key(self.keys.processed(&msg.queue))
            .arg(msg.id.as_str());
        if let Some(unique_key) = &msg.unique_key {
            invocation.key(self.keys.unique(unique_key));
        }

        let mut conn = self.conn().await?;
        let removed: i64 = invocation.invoke_async(&mut *conn).await?;
        if removed == 0 {
            return Err(Self::lease_lost(msg));
        }
        Ok(())
    }

    async fn retry(&self, msg: &TaskMessage, retry_at: DateTime<Utc>) -> TaskResult<()> {
        self.fail(msg, TaskState::Retry, retry_at).await
    }

    async fn archive(&self, msg: &TaskMessage) -> TaskResult<()> {
        self.fail(msg, TaskState::Dead, Utc::now()).await
    }

    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut conn = self.conn().await?;
        let moved: i64 = self
            .scripts
            .requeue
            .key(self.keys.lease(&msg.queue))
            .key(self.keys.task(&msg.queue, msg.id.as_str()))
            .key(self.keys.pending(&msg.queue))
            .arg(msg.id.as_str())
            .invoke_async(&mut *conn)
            .await?;

        if moved == 0 {
            return Err(Self::lease_lost(msg));
        }
        Ok(())
    }

    async fn forward(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64> {
        let mut conn = self.conn().await?;
        let mut moved = 0;
        for queue in queues {
            moved += self.move_due(&mut conn, queue, self.keys.scheduled(queue), now).await?;
            moved += self.move_due(&mut conn, queue, self.keys.retry(queue), now).await?;
        }
        Ok(moved)
    }

    async fn recover(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64> {
        let mut conn = self.conn().await?;
        let mut moved = 0;
        for queue in queues {
            moved += self.move_due(&mut conn, queue, self.keys.lease(queue), now).await?;
        }
        Ok(moved)
    }

    async fn queues(&self) -> TaskResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut queues: Vec<String> = conn.smembers(self.keys.queues()).await?;
        queues.sort();
        Ok(queues)
    }

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats> {
        let mut conn = self.conn().await?;

        let (pending, active, scheduled, retry, dead, processed, failed): (
            u64,
            u64,
            u64,
            u64,
            u64,
            Option<u64>,
            Option<u64>,
        ) = redis::pipe()
            .llen(self.keys.pending(queue))
            .zcard(self.keys.lease(queue))
            .zcard(self.keys.scheduled(queue))
            .zcard(self.keys.retry(queue))
            .zcard(self.keys.dead(queue))
            .get(self.keys.processed(queue))
            .get(self.keys.failed(queue))
            .query_async(&mut *conn)
            .await?;

        Ok(QueueStats {
            queue: queue.to_string(),
            size: 0,
            pending,
            active,
            scheduled,
            retry,
            dead,
            processed: processed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        }
        .with_size())
    }

    async fn list_tasks(&self, queue: &str, state: TaskState, offset: usize, limit: usize) -> TaskResult<Vec<TaskInfo>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let start = isize::try_from(offset).unwrap_or(isize::MAX);
        let stop = isize::try_from(offset + limit - 1).unwrap_or(isize::MAX);

        // Pending is a list consumed from the right, so the oldest entries sit at the end.
        let entries: Vec<(String, Option<f64>)> = if state == TaskState::Pending {
            let mut ids: Vec<String> = conn
                .lrange(self.keys.pending(queue), -(stop + 1), -(start + 1))
                .await?;
            ids.reverse();
            ids.into_iter().map(|id| (id, None)).collect()
        } else {
            let scored: Vec<(String, f64)> = conn
                .zrange_withscores(self.state_key(queue, state), start, stop)
                .await?;
            scored.into_iter().map(|(id, score)| (id, Some(score))).collect()
        };

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for (id, _) in &entries {
            pipe.hget(self.keys.task(queue, id), "msg");
        }
        let messages: Vec<Option<String>> = pipe.query_async(&mut *conn).await?;

        let now = Utc::now();
        let mut tasks = Vec::with_capacity(entries.len());
        for ((_, score), json) in entries.into_iter().zip(messages) {
            let Some(json) = json else { continue };
            let msg = TaskMessage::from_json(&json)?;
            let next = match state {
                TaskState::Scheduled | TaskState::Retry => score.and_then(from_millis),
                TaskState::Pending => Some(now),
                TaskState::Active | TaskState::Dead => None,
            };
            tasks.push(TaskInfo::from_message(&msg, state, next));
        }
        Ok(tasks)
    }

    async fn get_task(&self, queue: &str, id: &TaskId) -> TaskResult<TaskInfo> {
        let mut conn = self.conn().await?;
        let (state, msg) = self
            .load(&mut conn, queue, id.as_str())
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        let next = match state {
            TaskState::Scheduled | TaskState::Retry => {
                let score: Option<f64> = conn.zscore(self.state_key(queue, state), id.as_str()).await?;
                score.and_then(from_millis)
            }
            TaskState::Pending => Some(Utc::now()),
            TaskState::Active | TaskState::Dead => None,
        };

        Ok(TaskInfo::from_message(&msg, state, next))
    }

    async fn delete_task(&self, queue: &str, id: &TaskId) -> TaskResult<()> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .scripts
            .delete
            .key(self.keys.task(queue, id.as_str()))
            .key(self.keys.pending(queue))
            .key(self.keys.scheduled(queue))
            .key(self.keys.retry(queue))
            .key(self.keys.dead(queue))
            .arg(id.as_str())
            .arg(self.keys.unique_prefix())
            .invoke_async(&mut *conn)
            .await?;

        match result {
            1 => Ok(()),
            0 => Err(TaskError::NotFound(id.to_string())),
            _ => Err(TaskError::InvalidState {
                expected: "not active".to_string(),
                actual: TaskState::Active.to_string(),
            }),
        }
    }

    async fn run_task(&self, queue: &str, id: &TaskId) -> TaskResult<()> {
        let mut conn = self.conn().await?;
        let (state, mut msg) = self
            .load(&mut conn, queue, id.as_str())
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        if !matches!(state, TaskState::Scheduled | TaskState::Retry | TaskState::Dead) {
            return Err(TaskError::InvalidState {
                expected: "scheduled, retry or dead".to_string(),
                actual: state.to_string(),
            });
        }
        msg.retried = 0;

        let result: i64 = self
            .scripts
            .run
            .key(self.keys.task(queue, id.as_str()))
            .key(self.state_key(queue, state))
            .key(self.keys.pending(queue))
            .arg(id.as_str())
            .arg(state.as_str())
            .arg(msg.to_json()?)
            .invoke_async(&mut *conn)
            .await?;

        match result {
            1 => Ok(()),
            0 => Err(TaskError::NotFound(id.to_string())),
            _ => Err(TaskError::InvalidState {
                expected: state.to_string(),
                actual: "changed concurrently".to_string(),
            }),
        }
    }
}
