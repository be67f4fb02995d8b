//! In-process broker for embedded use and tests.

use super::{Broker, QueueStats, MOVE_BATCH_SIZE};
use crate::error::{TaskError, TaskResult};
use crate::task::{saturating_after, TaskId, TaskInfo, TaskMessage, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

struct Entry {
    msg: TaskMessage,
    state: TaskState,
    /// Process time for scheduled/retry, lease deadline for active, death time for dead.
    score: DateTime<Utc>,
}

#[derive(Default)]
struct QueueData {
    tasks: HashMap<TaskId, Entry>,
    /// Pending IDs, front is next to lease.
    pending: VecDeque<TaskId>,
    processed: u64,
    failed: u64,
}

impl QueueData {
    fn ids_in(&self, state: TaskState) -> Vec<(DateTime<Utc>, TaskId)> {
        let mut ids: Vec<_> = self
            .tasks
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(id, e)| (e.score, id.clone()))
            .collect();
        ids.sort();
        ids
    }

    fn count(&self, state: TaskState) -> u64 {
        self.tasks.values().filter(|e| e.state == state).count() as u64
    }

    fn take_active(&mut self, id: &TaskId) -> TaskResult<&mut Entry> {
        match self.tasks.get_mut(id) {
            Some(entry) if entry.state == TaskState::Active => Ok(entry),
            Some(entry) => Err(TaskError::InvalidState {
                expected: TaskState::Active.to_string(),
                actual: entry.state.to_string(),
            }),
            None => Err(TaskError::NotFound(id.to_string())),
        }
    }

    fn info(&self, entry: &Entry) -> TaskInfo {
        let next = match entry.state {
            TaskState::Scheduled | TaskState::Retry => Some(entry.score),
            TaskState::Pending => Some(Utc::now()),
            TaskState::Active | TaskState::Dead => None,
        };
        TaskInfo::from_message(&entry.msg, entry.state, next)
    }
}

#[derive(Default)]
struct Inner {
    queues: BTreeMap<String, QueueData>,
    /// Uniqueness key to (owner, expiry).
    unique: HashMap<String, (TaskId, DateTime<Utc>)>,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> TaskResult<()> {
        if self.closed {
            Err(TaskError::Connection("broker is closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn queue_mut(&mut self, queue: &str) -> TaskResult<&mut QueueData> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| TaskError::NotFound(format!("queue {queue}")))
    }

    fn release_unique(&mut self, msg: &TaskMessage) {
        if let Some(key) = &msg.unique_key {
            if matches!(self.unique.get(key), Some((owner, _)) if *owner == msg.id) {
                self.unique.remove(key);
            }
        }
    }
}

/// Broker keeping all state in process memory behind one lock.
///
/// Every operation runs in a single critical section, which makes
/// uniqueness and leasing atomic. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> TaskResult<()> {
        self.inner.lock().check_open()
    }

    async fn close(&self) -> TaskResult<()> {
        self.inner.lock().closed = true;
        Ok(())
    }

    async fn enqueue(&self, msg: &TaskMessage) -> TaskResult<TaskState> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let now = Utc::now();

        if inner
            .queues
            .get(&msg.queue)
            .is_some_and(|q| q.tasks.contains_key(&msg.id))
        {
            return Err(TaskError::TaskIdConflict(msg.id.to_string()));
        }

        if let (Some(key), Some(ttl)) = (&msg.unique_key, msg.unique_ttl_secs) {
            inner.unique.retain(|_, (_, expires)| *expires > now);
            if inner.unique.contains_key(key) {
                return Err(TaskError::DuplicateTask(key.clone()));
            }
            let expires = saturating_after(now, Duration::from_secs(ttl));
            inner.unique.insert(key.clone(), (msg.id.clone(), expires));
        }

        let state = if msg.process_at > now {
            TaskState::Scheduled
        } else {
            TaskState::Pending
        };

        let queue = inner.queues.entry(msg.queue.clone()).or_default();
        if state == TaskState::Pending {
            queue.pending.push_back(msg.id.clone());
        }
        queue.tasks.insert(
            msg.id.clone(),
            Entry {
                msg: msg.clone(),
                state,
                score: msg.process_at,
            },
        );

        debug!(task_id = %msg.id, queue = %msg.queue, state = %state, "Stored task");
        Ok(state)
    }

    async fn dequeue(&self, queues: &[String], lease_grace: Duration) -> TaskResult<Option<TaskMessage>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let now = Utc::now();

        for name in queues {
            let Some(queue) = inner.queues.get_mut(name) else {
                continue;
            };

            while let Some(id) = queue.pending.pop_front() {
                let Some(entry) = queue.tasks.get_mut(&id) else {
                    continue;
                };
                let lease = entry.msg.timeout().saturating_add(lease_grace);
                entry.state = TaskState::Active;
                entry.score = saturating_after(now, lease);
                return Ok(Some(entry.msg.clone()));
            }
        }

        Ok(None)
    }

    async fn done(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let queue = inner.queue_mut(&msg.queue)?;
        queue.take_active(&msg.id)?;
        queue.tasks.remove(&msg.id);
        queue.processed += 1;
        inner.release_unique(msg);
        Ok(())
    }

    async fn retry(&self, msg: &TaskMessage, retry_at: DateTime<Utc>) -> TaskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let queue = inner.queue_mut(&msg.queue)?;
        let entry = queue.take_active(&msg.id)?;
        entry.msg = msg.clone();
        entry.state = TaskState::Retry;
        entry.score = retry_at;
        queue.failed += 1;
        Ok(())
    }

    async fn archive(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let queue = inner.queue_mut(&msg.queue)?;
        let entry = queue.take_active(&msg.id)?;
        entry.msg = msg.clone();
        entry.state = TaskState::Dead;
        entry.score = Utc::now();
        queue.failed += 1;
        Ok(())
    }

    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let queue = inner.queue_mut(&msg.queue)?;
        let entry = queue.take_active(&msg.id)?;
        entry.state = TaskState::Pending;
        queue.pending.push_front(msg.id.clone());
        Ok(())
    }

    async fn forward(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let mut moved = 0u64;

        for name in queues {
            let Some(queue) = inner.queues.get_mut(name) else {
                continue;
            };
            for state in [TaskState::Scheduled, TaskState::Retry] {
                let due = queue
                    .ids_in(state)
                    .into_iter()
                    .take_while(|(at, _)| *at <= now)
                    .take(MOVE_BATCH_SIZE);
                for (_, id) in due {
                    if let Some(entry) = queue.tasks.get_mut(&id) {
                        entry.state = TaskState::Pending;
                        queue.pending.push_back(id);
                        moved += 1;
                    }
                }
            }
        }

        Ok(moved)
    }

    async fn recover(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let mut moved = 0u64;

        for name in queues {
            let Some(queue) = inner.queues.get_mut(name) else {
                continue;
            };
            let expired = queue
                .ids_in(TaskState::Active)
                .into_iter()
                .take_while(|(deadline, _)| *deadline < now)
                .take(MOVE_BATCH_SIZE);
            for (_, id) in expired {
                if let Some(entry) = queue.tasks.get_mut(&id) {
                    entry.state = TaskState::Pending;
                    queue.pending.push_back(id);
                    moved += 1;
                }
            }
        }

        Ok(moved)
    }

    async fn queues(&self) -> TaskResult<Vec<String>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.queues.keys().cloned().collect())
    }

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats> {
        let inner = self.inner.lock();
        inner.check_open()?;

        let Some(data) = inner.queues.get(queue) else {
            return Ok(QueueStats::empty(queue));
        };

        Ok(QueueStats {
            queue: queue.to_string(),
            size: 0,
            pending: data.count(TaskState::Pending),
            active: data.count(TaskState::Active),
            scheduled: data.count(TaskState::Scheduled),
            retry: data.count(TaskState::Retry),
            dead: data.count(TaskState::Dead),
            processed: data.processed,
            failed: data.failed,
        }
        .with_size())
    }

    async fn list_tasks(&self, queue: &str, state: TaskState, offset: usize, limit: usize) -> TaskResult<Vec<TaskInfo>> {
        let inner = self.inner.lock();
        inner.check_open()?;

        let Some(data) = inner.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let ids: Vec<TaskId> = if state == TaskState::Pending {
            data.pending.iter().cloned().collect()
        } else {
            data.ids_in(state).into_iter().map(|(_, id)| id).collect()
        };

        Ok(ids
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| data.tasks.get(id))
            .map(|entry| data.info(entry))
            .collect())
    }

    async fn get_task(&self, queue: &str, id: &TaskId) -> TaskResult<TaskInfo> {
        let inner = self.inner.lock();
        inner.check_open()?;

        inner
            .queues
            .get(queue)
            .and_then(|data| data.tasks.get(id).map(|entry| data.info(entry)))
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    async fn delete_task(&self, queue: &str, id: &TaskId) -> TaskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let data = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        match data.tasks.get(id).map(|e| e.state) {
            None => return Err(TaskError::NotFound(id.to_string())),
            Some(TaskState::Active) => {
                return Err(TaskError::InvalidState {
                    expected: "not active".to_string(),
                    actual: TaskState::Active.to_string(),
                })
            }
            Some(TaskState::Pending) => data.pending.retain(|p| p != id),
            Some(_) => {}
        }

        if let Some(entry) = data.tasks.remove(id) {
            inner.release_unique(&entry.msg);
        }
        Ok(())
    }

    async fn run_task(&self, queue: &str, id: &TaskId) -> TaskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let data = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        let entry = data
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        match entry.state {
            TaskState::Scheduled | TaskState::Retry | TaskState::Dead => {
                entry.state = TaskState::Pending;
                entry.msg.retried = 0;
                data.pending.push_back(id.clone());
                Ok(())
            }
            other => Err(TaskError::InvalidState {
                expected: "scheduled, retry or dead".to_string(),
                actual: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use crate::options::{EnqueueOptions, TaskDefaults};
    use crate::task::Task;

    fn message(opts: EnqueueOptions) -> TaskMessage {
        opts.build(&Task::new("email:send", "{}"), &TaskDefaults::default(), Utc::now())
            .unwrap()
    }

    fn queues() -> Vec<String> {
        vec!["default".to_string()]
    }

    #[tokio::test]
    async fn test_fifo_lease_and_done() {
        let broker = MemoryBroker::new();
        let first = message(EnqueueOptions::new());
        let second = message(EnqueueOptions::new());
        broker.enqueue(&first).await.unwrap();
        broker.enqueue(&second).await.unwrap();

        let leased = broker.dequeue(&queues(), Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(leased.id, first.id);
        assert_eq!(broker.queue_stats("default").await.unwrap().active, 1);

        broker.done(&leased).await.unwrap();
        let stats = broker.queue_stats("default").await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_unique_rejects_duplicate_until_done() {
        let broker = MemoryBroker::new();
        let opts = EnqueueOptions::new().unique(Duration::from_secs(60));
        broker.enqueue(&message(opts.clone())).await.unwrap();

        let err = broker.enqueue(&message(opts.clone())).await.unwrap_err();
        assert!(matches!(err, TaskError::DuplicateTask(_)));

        let leased = broker.dequeue(&queues(), Duration::ZERO).await.unwrap().unwrap();
        broker.done(&leased).await.unwrap();
        broker.enqueue(&message(opts)).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_unique_keys_pruned_on_enqueue() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(&message(EnqueueOptions::new().unique_key("stale", Duration::from_secs(60))))
            .await
            .unwrap();
        for (_, expires) in broker.inner.lock().unique.values_mut() {
            *expires = Utc::now() - ChronoDuration::seconds(1);
        }

        broker
            .enqueue(&message(EnqueueOptions::new().unique_key("fresh", Duration::from_secs(60))))
            .await
            .unwrap();

        let inner = broker.inner.lock();
        assert_eq!(inner.unique.len(), 1);
        assert!(inner.unique.contains_key("fresh"));
    }

    #[tokio::test]
    async fn test_explicit_id_conflict() {
        let broker = MemoryBroker::new();
        broker.enqueue(&message(EnqueueOptions::new().task_id("a"))).await.unwrap();
        let err = broker
            .enqueue(&message(EnqueueOptions::new().task_id("a")))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::TaskIdConflict(_)));
    }

    #[tokio::test]
    async fn test_scheduled_invisible_until_forwarded() {
        let broker = MemoryBroker::new();
        let msg = message(EnqueueOptions::new().process_in(Duration::from_secs(30)));
        assert_eq!(broker.enqueue(&msg).await.unwrap(), TaskState::Scheduled);
        assert!(broker.dequeue(&queues(), Duration::ZERO).await.unwrap().is_none());

        assert_eq!(broker.forward(&queues(), Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + ChronoDuration::seconds(31);
        assert_eq!(broker.forward(&queues(), later).await.unwrap(), 1);
        assert!(broker.dequeue(&queues(), Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_expired_lease() {
        let broker = MemoryBroker::new();
        let msg = message(EnqueueOptions::new().timeout(Duration::from_secs(1)));
        broker.enqueue(&msg).await.unwrap();
        broker.dequeue(&queues(), Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(broker.recover(&queues(), Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + ChronoDuration::seconds(5);
        assert_eq!(broker.recover(&queues(), later).await.unwrap(), 1);

        let info = broker.get_task("default", &msg.id).await.unwrap();
        assert_eq!(info.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_retry_archive_and_run() {
        let broker = MemoryBroker::new();
        let msg = message(EnqueueOptions::new());
        broker.enqueue(&msg).await.unwrap();

        let mut leased = broker.dequeue(&queues(), Duration::ZERO).await.unwrap().unwrap();
        leased.retried += 1;
        broker.retry(&leased, Utc::now()).await.unwrap();
        assert_eq!(broker.get_task("default", &msg.id).await.unwrap().retried, 1);

        broker.forward(&queues(), Utc::now()).await.unwrap();
        let leased = broker.dequeue(&queues(), Duration::ZERO).await.unwrap().unwrap();
        broker.archive(&leased).await.unwrap();

        let dead = broker.list_tasks("default", TaskState::Dead, 0, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(broker.queue_stats("default").await.unwrap().failed, 2);

        broker.run_task("default", &msg.id).await.unwrap();
        let info = broker.get_task("default", &msg.id).await.unwrap();
        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(info.retried, 0);
    }

    #[tokio::test]
    async fn test_delete_rejects_active() {
        let broker = MemoryBroker::new();
        let msg = message(EnqueueOptions::new());
        broker.enqueue(&msg).await.unwrap();
        broker.dequeue(&queues(), Duration::ZERO).await.unwrap();

        let err = broker.delete_task("default", &msg.id).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_delete_pending_removes_from_queue() {
        let broker = MemoryBroker::new();
        let msg = message(EnqueueOptions::new());
        broker.enqueue(&msg).await.unwrap();
        broker.delete_task("default", &msg.id).await.unwrap();

        assert!(broker.dequeue(&queues(), Duration::ZERO).await.unwrap().is_none());
        assert!(matches!(
            broker.get_task("default", &msg.id).await,
            Err(TaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_requeue_goes_to_front() {
        let broker = MemoryBroker::new();
        let first = message(EnqueueOptions::new());
        let second = message(EnqueueOptions::new());
        broker.enqueue(&first).await.unwrap();
        broker.enqueue(&second).await.unwrap();

        let leased = broker.dequeue(&queues(), Duration::ZERO).await.unwrap().unwrap();
        broker.requeue(&leased).await.unwrap();
        let again = broker.dequeue(&queues(), Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_closed_broker_fails() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        let err = broker.ping().await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
