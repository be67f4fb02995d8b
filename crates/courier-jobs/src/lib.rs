//! Courier Jobs - Background Task Processing
//!
//! A broker-backed task queue with:
//! - A handler registry keyed by task type, frozen when the pool starts
//! - An enqueue client with delayed, scheduled and unique tasks
//! - A worker pool with weighted or strict queue priority
//! - Per-task timeouts, exponential retry backoff and a dead set
//! - Leases that return crashed work to its queue (at-least-once delivery)
//! - A lifecycle controller with lazy start and graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Lifecycle                           │
//! │                                                              │
//! │   Client ──enqueue──►┌──────────────────────────┐            │
//! │                      │          Broker          │            │
//! │                      │  scheduled  retry  dead  │            │
//! │   Forwarder ────────►│      │        │          │            │
//! │                      │      ▼        ▼          │            │
//! │                      │  pending ───► lease      │◄── Recoverer│
//! │                      └─────┬────────────────────┘            │
//! │                            │ dequeue (queue selector)        │
//! │                            ▼                                 │
//! │   ┌────────┐ ┌────────┐ ┌────────┐                           │
//! │   │ Slot 1 │ │ Slot 2 │ │ Slot N │ ── handler (registry)     │
//! │   └────────┘ └────────┘ └────────┘                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_jobs::prelude::*;
//! use std::sync::Arc;
//!
//! let lifecycle = Lifecycle::new(config, Arc::new(MemoryBroker::new()));
//!
//! lifecycle.handle_fn("email:send", |ctx, task| async move {
//!     let email: Email = task.payload_json()?;
//!     send(email).await.map_err(TaskError::handler)?;
//!     Ok(())
//! });
//!
//! lifecycle
//!     .enqueue(Task::json("email:send", &email)?, EnqueueOptions::new().queue("critical"))
//!     .await?;
//!
//! lifecycle.run().await?;
//! ```

pub mod broker;
pub mod client;
pub mod error;
pub mod inspector;
pub mod lifecycle;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod selector;
pub mod task;

pub use broker::{Broker, MemoryBroker, QueueStats, RedisBroker};
pub use client::Client;
pub use error::{TaskError, TaskResult};
pub use inspector::{DashboardStats, Inspector};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use metrics::{register_metrics, TaskMetrics, WorkerMetrics};
pub use options::{derive_unique_key, EnqueueOptions, TaskDefaults};
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use registry::{FrozenRegistry, Handler, TaskRegistry};
pub use retry::RetryPolicy;
pub use selector::{QueueSelector, SelectionMode};
pub use task::{Task, TaskContext, TaskId, TaskInfo, TaskMessage, TaskState};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::broker::{Broker, MemoryBroker, RedisBroker};
    pub use crate::lifecycle::Lifecycle;
    pub use crate::options::EnqueueOptions;
    pub use crate::registry::Handler;
    pub use crate::task::{Task, TaskContext, TaskState};
    pub use crate::{TaskError, TaskResult};
}
