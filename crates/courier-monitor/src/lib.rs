//! Courier Monitor - HTTP introspection for the worker pool
//!
//! Mounts a JSON API under a path prefix of an existing axum router:
//!
//! | Method | Path                              | Description                    |
//! |--------|-----------------------------------|--------------------------------|
//! | GET    | `/`                               | Lifecycle, pool and queue totals |
//! | GET    | `/pool`                           | Pool counters                  |
//! | GET    | `/queues`                         | Stats for every queue          |
//! | GET    | `/queues/:queue`                  | Stats for one queue            |
//! | GET    | `/queues/:queue/tasks`            | Tasks by `state`, paginated    |
//! | GET    | `/queues/:queue/tasks/:id`        | One task                       |
//! | DELETE | `/queues/:queue/tasks/:id`        | Delete a task                  |
//! | POST   | `/queues/:queue/tasks/:id/run`    | Run a task now                 |
//!
//! In readonly mode the mutating endpoints answer `403 READ_ONLY`.

mod error;
mod handlers;

pub use error::{ErrorResponse, MonitorError, MonitorResult};
pub use handlers::{DashboardResponse, PoolResponse, QueuesResponse, TaskListResponse};

use axum::Router;
use courier_config::MonitorConfig;
use courier_jobs::{Lifecycle, TaskResult};
use tracing::info;

/// Monitor behaviour.
#[derive(Debug, Clone, Default)]
pub struct MonitorOptions {
    /// Reject delete and run requests.
    pub readonly: bool,
}

impl From<&MonitorConfig> for MonitorOptions {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            readonly: config.readonly,
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct MonitorState {
    lifecycle: Lifecycle,
    readonly: bool,
}

/// Monitor routes with state applied, rooted at `/`.
pub fn routes(lifecycle: Lifecycle, options: MonitorOptions) -> Router {
    handlers::router().with_state(MonitorState {
        lifecycle,
        readonly: options.readonly,
    })
}

/// Mounts the monitor on `router` at `path`.
///
/// Starts the worker pool if it is not running yet, so that a web process
/// that only mounts the monitor also processes tasks.
pub async fn mount(router: Router, path: &str, lifecycle: &Lifecycle, options: MonitorOptions) -> TaskResult<Router> {
    lifecycle.ensure_started().await?;

    let readonly = options.readonly;
    let monitor = routes(lifecycle.clone(), options);
    let prefix = path.trim_end_matches('/');

    if prefix.is_empty() {
        info!(path = "/", readonly, "Task monitor mounted");
        Ok(router.merge(monitor))
    } else {
        info!(path = prefix, readonly, "Task monitor mounted");
        Ok(router.nest(prefix, monitor))
    }
}
