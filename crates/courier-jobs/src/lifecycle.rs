//! Process-wide lifecycle: lazy start, signal handling and graceful shutdown.

use crate::broker::{Broker, RedisBroker};
use crate::client::Client;
use crate::error::{TaskError, TaskResult};
use crate::inspector::Inspector;
use crate::options::{EnqueueOptions, TaskDefaults};
use crate::pool::{PoolConfig, PoolCounters, PoolStats, WorkerPool};
use crate::registry::{Handler, TaskRegistry};
use crate::task::{Task, TaskContext, TaskInfo};
use chrono::{DateTime, Utc};
use courier_config::{format_validation_errors, AppConfig, ConfigValidator};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Control {
    pool: Option<WorkerPool>,
    terminal: Option<String>,
}

struct Inner {
    config: AppConfig,
    registry: TaskRegistry,
    broker: Arc<dyn Broker>,
    client: Client,
    inspector: Inspector,
    pool_config: PoolConfig,
    counters: Arc<PoolCounters>,
    control: Mutex<Control>,
    state: watch::Sender<LifecycleState>,
}

/// Owns the registry, the broker and the worker pool of one process.
///
/// Cheap to clone; every clone controls the same pool. The pool starts on the
/// first call to [`run`](Self::run), [`ensure_started`](Self::ensure_started)
/// or one of the `enqueue*` methods, and never restarts once stopped.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    /// Creates a lifecycle over an existing broker. Nothing is started.
    pub fn new(config: AppConfig, broker: Arc<dyn Broker>) -> Self {
        let defaults = TaskDefaults::from(&config);
        let pool_config = PoolConfig::from(&config);
        let client = Client::new(broker.clone(), defaults);
        let inspector = Inspector::new(broker.clone(), pool_config.selector.queues().to_vec());
        let (state, _) = watch::channel(LifecycleState::Uninitialized);

        Self {
            inner: Arc::new(Inner {
                config,
                registry: TaskRegistry::new(),
                broker,
                client,
                inspector,
                pool_config,
                counters: Arc::new(PoolCounters::default()),
                control: Mutex::new(Control::default()),
                state,
            }),
        }
    }

    /// Creates a lifecycle backed by Redis.
    ///
    /// Only builds the connection pool; reachability is checked on start.
    pub fn with_redis(config: AppConfig) -> TaskResult<Self> {
        let broker = RedisBroker::from_config(&config.redis)?;
        Ok(Self::new(config, Arc::new(broker)))
    }

    /// Registers a handler for `task_type`. Ignored once the pool has started.
    pub fn handle(&self, task_type: impl Into<String>, handler: impl Handler) -> bool {
        self.inner.registry.handle(task_type, handler)
    }

    /// Registers an async closure for `task_type`. Ignored once the pool has started.
    pub fn handle_fn<F, Fut>(&self, task_type: impl Into<String>, f: F) -> bool
    where
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.inner.registry.handle_fn(task_type, f)
    }

    /// Starts the pool unless already started or stopped.
    ///
    /// Concurrent callers wait for the first one; only one startup ever runs.
    pub async fn ensure_started(&self) -> TaskResult<()> {
        if self.state() != LifecycleState::Uninitialized {
            return Ok(());
        }

        let mut control = self.inner.control.lock().await;
        if self.state() != LifecycleState::Uninitialized {
            return Ok(());
        }

        ConfigValidator::validate(&self.inner.config)
            .map_err(|errors| TaskError::Configuration(format_validation_errors(&errors)))?;

        self.inner.broker.ping().await.map_err(|e| {
            error!(error = %e, "Broker unreachable; worker pool not started");
            e
        })?;

        let handlers = self.inner.registry.freeze();
        if handlers.is_empty() {
            warn!("No task handlers registered; every task will fail");
        }

        let pool = WorkerPool::start(
            self.inner.broker.clone(),
            handlers,
            self.inner.pool_config.clone(),
            self.inner.counters.clone(),
        );
        self.spawn_watcher(pool.fatal());
        control.pool = Some(pool);

        self.inner.state.send_replace(LifecycleState::Started);
        info!("Task processing started");
        Ok(())
    }

    /// Stops the pool gracefully and closes the broker.
    ///
    /// Waits up to the configured shutdown timeout for in-flight handlers.
    /// Every concurrent caller returns once the lifecycle is stopped.
    pub async fn shutdown(&self) {
        let mut control = self.inner.control.lock().await;

        match self.state() {
            LifecycleState::Stopped => return,
            LifecycleState::Uninitialized => {
                info!("Shutdown requested before start");
            }
            LifecycleState::Started | LifecycleState::Stopping => {
                self.inner.state.send_replace(LifecycleState::Stopping);
                if let Some(pool) = control.pool.take() {
                    control.terminal = pool.shutdown(self.inner.config.worker.shutdown_timeout()).await;
                }
            }
        }

        if let Err(e) = self.inner.broker.close().await {
            warn!(error = %e, "Failed to close broker");
        }

        self.inner.state.send_replace(LifecycleState::Stopped);
        info!("Task processing stopped");
    }

    /// Starts the pool and waits until it stops.
    ///
    /// Returns the startup error, or the terminal error of a worker loop that died.
    pub async fn run(&self) -> TaskResult<()> {
        self.ensure_started().await?;
        self.stopped().await;

        match self.inner.control.lock().await.terminal.clone() {
            Some(message) => Err(TaskError::Internal(message)),
            None => Ok(()),
        }
    }

    /// Resolves once the lifecycle reaches [`LifecycleState::Stopped`].
    pub async fn stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this only returns on a match.
        let _ = rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Pool counters of this process.
    pub fn stats(&self) -> PoolStats {
        PoolStats::new(&self.inner.pool_config, &self.inner.counters)
    }

    /// Enqueue client sharing this lifecycle's broker. Never starts the pool.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Broker introspection.
    pub fn inspector(&self) -> &Inspector {
        &self.inner.inspector
    }

    /// Loaded configuration.
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Starts the pool if needed, then enqueues.
    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> TaskResult<TaskInfo> {
        self.ensure_started().await?;
        self.inner.client.enqueue(task, opts).await
    }

    /// Starts the pool if needed, then enqueues for processing after `delay`.
    pub async fn enqueue_in(&self, task: Task, delay: Duration) -> TaskResult<TaskInfo> {
        self.ensure_started().await?;
        self.inner.client.enqueue_in(task, delay).await
    }

    /// Starts the pool if needed, then enqueues for processing at `at`.
    pub async fn enqueue_at(&self, task: Task, at: DateTime<Utc>) -> TaskResult<TaskInfo> {
        self.ensure_started().await?;
        self.inner.client.enqueue_at(task, at).await
    }

    /// Starts the pool if needed, then enqueues unless a duplicate exists.
    pub async fn enqueue_unique(&self, task: Task, ttl: Duration) -> TaskResult<TaskInfo> {
        self.ensure_started().await?;
        self.inner.client.enqueue_unique(task, ttl).await
    }

    fn spawn_watcher(&self, fatal: CancellationToken) {
        let lifecycle = self.clone();
        let handle_signals = self.inner.config.worker.handle_signals;

        tokio::spawn(async move {
            let mut state = lifecycle.inner.state.subscribe();

            tokio::select! {
                () = shutdown_signal(), if handle_signals => {}
                () = fatal.cancelled() => {
                    error!("Worker pool failed; shutting down");
                }
                _ = state.wait_for(|s| *s == LifecycleState::Stopped) => return,
            }

            lifecycle.shutdown().await;
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.worker.concurrency = 2;
        config.worker.poll_interval_ms = 10;
        config.worker.handle_signals = false;
        config
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let broker = Arc::new(MemoryBroker::new());
        let lifecycle = Lifecycle::new(config(), broker.clone());

        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert!(broker.ping().await.is_err());

        // No restart once stopped.
        lifecycle.ensure_started().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_prevents_start() {
        let mut config = config();
        config.worker.concurrency = 0;
        let lifecycle = Lifecycle::new(config, Arc::new(MemoryBroker::new()));

        let err = lifecycle.ensure_started().await.unwrap_err();
        assert!(matches!(err, TaskError::Configuration(_)));
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn test_unreachable_broker_prevents_start() {
        let broker = Arc::new(MemoryBroker::new());
        broker.close().await.unwrap();
        let lifecycle = Lifecycle::new(config(), broker);

        let err = lifecycle.run().await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

        // Registration stays open after a failed start.
        assert!(lifecycle.handle_fn("email:send", |_, _| async { Ok(()) }));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let lifecycle = Lifecycle::new(config(), Arc::new(MemoryBroker::new()));
        lifecycle.ensure_started().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Started);
        assert!(!lifecycle.handle_fn("late", |_, _| async { Ok(()) }));

        let runner = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.run().await })
        };
        lifecycle.shutdown().await;

        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        runner.await.unwrap().unwrap();
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Stopping.to_string(), "stopping");
        assert_eq!(
            serde_json::to_string(&LifecycleState::Started).unwrap(),
            "\"started\""
        );
    }
}
