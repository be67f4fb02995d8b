//! Worker pool: execution slots plus the forwarder and recoverer loops.

use crate::broker::Broker;
use crate::error::TaskError;
use crate::metrics::{TaskMetrics, WorkerMetrics};
use crate::registry::FrozenRegistry;
use crate::retry::RetryPolicy;
use crate::selector::{QueueSelector, SelectionMode};
use crate::task::{saturating_after, TaskContext, TaskMessage};
use chrono::Utc;
use courier_config::AppConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent execution slots.
    pub concurrency: usize,

    /// Idle wait between empty dequeue attempts.
    pub poll_interval: Duration,

    /// Lease time granted on top of each task's timeout.
    pub lease_grace: Duration,

    /// Forwarder period.
    pub forward_interval: Duration,

    /// Recoverer period.
    pub recover_interval: Duration,

    /// Queue ordering.
    pub selector: QueueSelector,

    /// Backoff between attempts.
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for PoolConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.worker.concurrency,
            poll_interval: config.worker.poll_interval(),
            lease_grace: config.worker.lease_grace(),
            forward_interval: config.worker.forward_interval(),
            recover_interval: config.worker.recover_interval(),
            selector: QueueSelector::from_config(&config.queues),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Live pool counters.
#[derive(Debug, Default)]
pub struct PoolCounters {
    active: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl PoolCounters {
    /// Slots currently running a handler.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Tasks completed successfully.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Failed attempts.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Configured concurrency.
    pub concurrency: usize,

    /// Slots currently running a handler.
    pub active: u64,

    /// Tasks completed by this process.
    pub processed: u64,

    /// Failed attempts in this process.
    pub failed: u64,

    /// Queues being processed, highest weight first.
    pub queues: Vec<String>,

    /// True when queues are drained in strict priority order.
    pub strict_priority: bool,
}

impl PoolStats {
    pub(crate) fn new(config: &PoolConfig, counters: &PoolCounters) -> Self {
        Self {
            concurrency: config.concurrency,
            active: counters.active(),
            processed: counters.processed(),
            failed: counters.failed(),
            queues: config.selector.queues().to_vec(),
            strict_priority: config.selector.mode() == SelectionMode::Strict,
        }
    }
}

struct Shared {
    broker: Arc<dyn Broker>,
    handlers: FrozenRegistry,
    config: PoolConfig,
    counters: Arc<PoolCounters>,
    /// Stops slots from leasing and stops the background loops.
    shutdown: CancellationToken,
    /// Parent of every handler context; cancelled when the grace period runs out.
    abandon: CancellationToken,
    /// Cancelled when a slot dies unexpectedly.
    fatal: CancellationToken,
    terminal: Mutex<Option<String>>,
}

/// Running worker pool.
pub struct WorkerPool {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawns the slots, the forwarder and the recoverer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(broker: Arc<dyn Broker>, handlers: FrozenRegistry, config: PoolConfig, counters: Arc<PoolCounters>) -> Self {
        let shared = Arc::new(Shared {
            broker,
            handlers,
            config,
            counters,
            shutdown: CancellationToken::new(),
            abandon: CancellationToken::new(),
            fatal: CancellationToken::new(),
            terminal: Mutex::new(None),
        });

        info!(
            concurrency = shared.config.concurrency,
            queues = ?shared.config.selector.queues(),
            mode = ?shared.config.selector.mode(),
            task_types = ?shared.handlers.task_types(),
            "Starting worker pool"
        );
        WorkerMetrics::set_concurrency(shared.config.concurrency);

        let mut set = JoinSet::new();
        for slot in 0..shared.config.concurrency {
            set.spawn(run_slot(shared.clone()).instrument(info_span!("worker_slot", slot)));
        }
        set.spawn(run_forwarder(shared.clone()).instrument(info_span!("forwarder")));
        set.spawn(run_recoverer(shared.clone()).instrument(info_span!("recoverer")));

        let supervisor = tokio::spawn(supervise(shared.clone(), set));

        Self { shared, supervisor }
    }

    /// Token cancelled if a slot dies unexpectedly.
    pub fn fatal(&self) -> CancellationToken {
        self.shared.fatal.clone()
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats::new(&self.shared.config, &self.shared.counters)
    }

    /// Stops leasing and waits up to `grace` for in-flight handlers.
    ///
    /// When the grace period runs out, handler contexts are cancelled and the
    /// slots abandoned; their tasks are recovered once the lease expires.
    /// Returns the terminal error of a slot that died, if any.
    pub async fn shutdown(mut self, grace: Duration) -> Option<String> {
        info!(
            active = self.shared.counters.active(),
            grace_secs = grace.as_secs_f64(),
            "Stopping worker pool..."
        );
        self.shared.shutdown.cancel();

        match timeout(grace, &mut self.supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Worker pool supervisor failed"),
            Err(_) => {
                warn!(
                    active = self.shared.counters.active(),
                    "Shutdown grace period exceeded; abandoning in-flight tasks"
                );
                self.shared.abandon.cancel();
                self.supervisor.abort();
            }
        }

        info!(
            processed = self.shared.counters.processed(),
            failed = self.shared.counters.failed(),
            "Worker pool stopped"
        );

        self.shared.terminal.lock().take()
    }
}

async fn supervise(shared: Arc<Shared>, mut set: JoinSet<()>) {
    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            if e.is_cancelled() {
                continue;
            }
            let message = panic_message(e);
            error!(error = %message, "Worker loop panicked; stopping pool");
            shared.terminal.lock().get_or_insert(message);
            shared.shutdown.cancel();
            shared.fatal.cancel();
        }
    }
}

async fn run_slot(shared: Arc<Shared>) {
    debug!("Worker slot started");

    while !shared.shutdown.is_cancelled() {
        let queues = shared.config.selector.order();

        match shared.broker.dequeue(&queues, shared.config.lease_grace).await {
            Ok(Some(msg)) => {
                if shared.shutdown.is_cancelled() {
                    // Leased while shutting down: hand it back untouched.
                    if let Err(e) = shared.broker.requeue(&msg).await {
                        warn!(task_id = %msg.id, error = %e, "Failed to requeue task during shutdown");
                    }
                    break;
                }
                execute(&shared, msg).await;
            }
            Ok(None) => idle(&shared).await,
            Err(e) => {
                error!(error = %e, "Failed to dequeue task");
                idle(&shared).await;
            }
        }
    }

    debug!("Worker slot stopped");
}

async fn idle(shared: &Shared) {
    tokio::select! {
        () = tokio::time::sleep(shared.config.poll_interval) => {}
        () = shared.shutdown.cancelled() => {}
    }
}

async fn execute(shared: &Shared, mut msg: TaskMessage) {
    let started = Instant::now();
    let active = shared.counters.active.fetch_add(1, Ordering::Relaxed) + 1;
    WorkerMetrics::update_active(active);

    debug!(
        task_id = %msg.id,
        task_type = %msg.type_name,
        queue = %msg.queue,
        attempt = msg.retried + 1,
        "Processing task"
    );

    let result = match shared.handlers.get(&msg.type_name) {
        None => Err(TaskError::Handler(format!(
            "no handler registered for task type {}",
            msg.type_name
        ))),
        Some(handler) => {
            let token = shared.abandon.child_token();
            let deadline = saturating_after(Utc::now(), msg.timeout());
            let ctx = TaskContext::new(&msg, deadline, token.clone());
            let task = msg.task();
            let span = info_span!(
                "task",
                task_id = %msg.id,
                task_type = %msg.type_name,
                queue = %msg.queue,
                attempt = msg.retried + 1
            );

            let mut handle = tokio::spawn(async move { handler.process(ctx, task).await }.instrument(span));

            match timeout(msg.timeout(), &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(TaskError::Handler(format!("handler panicked: {}", panic_message(e)))),
                Err(_) => {
                    // The handler keeps running detached; its context is cancelled.
                    token.cancel();
                    Err(TaskError::Timeout(msg.timeout_secs))
                }
            }
        }
    };

    let active = shared.counters.active.fetch_sub(1, Ordering::Relaxed) - 1;
    WorkerMetrics::update_active(active);

    if shared.abandon.is_cancelled() {
        warn!(task_id = %msg.id, "Task abandoned at shutdown; lease left to expire");
        return;
    }

    record_outcome(shared, &mut msg, result, started.elapsed()).await;
}

async fn record_outcome(shared: &Shared, msg: &mut TaskMessage, result: Result<(), TaskError>, elapsed: Duration) {
    match result {
        Ok(()) => {
            shared.counters.processed.fetch_add(1, Ordering::Relaxed);
            TaskMetrics::task_processed(&msg.queue, &msg.type_name, elapsed);

            match shared.broker.done(msg).await {
                Ok(()) => debug!(task_id = %msg.id, elapsed_ms = elapsed.as_millis() as u64, "Task completed"),
                Err(e) => warn!(task_id = %msg.id, error = %e, "Failed to mark task done"),
            }
        }
        Err(err) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            TaskMetrics::task_failed(&msg.queue, &msg.type_name, err.kind(), elapsed);

            let now = Utc::now();
            msg.record_failure(&err, now);

            if !err.is_retryable() || msg.retry_exhausted() {
                TaskMetrics::task_dead(&msg.queue, &msg.type_name);
                match shared.broker.archive(msg).await {
                    Ok(()) => warn!(
                        task_id = %msg.id,
                        task_type = %msg.type_name,
                        retried = msg.retried,
                        error = %err,
                        "Task moved to dead set"
                    ),
                    Err(e) => error!(task_id = %msg.id, error = %e, "Failed to archive task"),
                }
            } else {
                msg.retried += 1;
                let delay = shared.config.retry.delay_for_retry(msg.retried);
                let retry_at = saturating_after(now, delay);
                TaskMetrics::task_retried(&msg.queue, &msg.type_name);

                match shared.broker.retry(msg, retry_at).await {
                    Ok(()) => warn!(
                        task_id = %msg.id,
                        task_type = %msg.type_name,
                        retried = msg.retried,
                        max_retry = msg.max_retry,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Task failed; scheduled for retry"
                    ),
                    Err(e) => error!(task_id = %msg.id, error = %e, "Failed to schedule retry"),
                }
            }
        }
    }
}

async fn run_forwarder(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.forward_interval);
    let queues = shared.config.selector.queues().to_vec();

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {
                match shared.broker.forward(&queues, Utc::now()).await {
                    Ok(0) => {}
                    Ok(moved) => {
                        debug!(count = moved, "Forwarded due tasks");
                        TaskMetrics::tasks_forwarded(moved);
                    }
                    Err(e) => warn!(error = %e, "Failed to forward due tasks"),
                }
            }
        }
    }
}

async fn run_recoverer(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.recover_interval);
    let queues = shared.config.selector.queues().to_vec();

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {
                match shared.broker.recover(&queues, Utc::now()).await {
                    Ok(0) => {}
                    Ok(moved) => {
                        warn!(count = moved, "Recovered tasks with expired leases");
                        TaskMetrics::tasks_recovered(moved);
                    }
                    Err(e) => warn!(error = %e, "Failed to recover expired leases"),
                }
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task was cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
