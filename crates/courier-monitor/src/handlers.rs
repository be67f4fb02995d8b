//! Monitor endpoint handlers.

use crate::error::{MonitorError, MonitorResult};
use crate::MonitorState;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use courier_jobs::{DashboardStats, LifecycleState, PoolStats, QueueStats, TaskId, TaskInfo, TaskState};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Create the monitor router.
pub fn router() -> Router<MonitorState> {
    Router::new()
        .route("/", get(dashboard))
        .route("/pool", get(pool))
        .route("/queues", get(list_queues))
        .route("/queues/:queue", get(queue_stats))
        .route("/queues/:queue/tasks", get(list_tasks))
        .route("/queues/:queue/tasks/:id", get(get_task).delete(delete_task))
        .route("/queues/:queue/tasks/:id/run", post(run_task))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for task listing.
#[derive(Debug, Deserialize)]
pub struct TaskListParams {
    /// Task state; defaults to pending.
    pub state: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Dashboard response.
#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub state: LifecycleState,
    pub pool: PoolStats,
    pub broker: DashboardStats,
}

/// Worker pool response.
#[derive(Debug, Serialize)]
pub struct PoolResponse {
    pub state: LifecycleState,
    #[serde(flatten)]
    pub stats: PoolStats,
}

/// Queue list response.
#[derive(Debug, Serialize)]
pub struct QueuesResponse {
    pub queues: Vec<QueueStats>,
}

/// Task page response.
#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub queue: String,
    pub state: TaskState,
    pub tasks: Vec<TaskInfo>,
    /// Tasks in this state, across all pages.
    pub total: u64,
    pub offset: usize,
    pub limit: usize,
}

/// Simple message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

// ============================================================================
// Handler Functions
// ============================================================================

async fn dashboard(State(state): State<MonitorState>) -> MonitorResult<DashboardResponse> {
    let broker = state.lifecycle.inspector().dashboard().await?;
    Ok(Json(DashboardResponse {
        state: state.lifecycle.state(),
        pool: state.lifecycle.stats(),
        broker,
    }))
}

async fn pool(State(state): State<MonitorState>) -> MonitorResult<PoolResponse> {
    Ok(Json(PoolResponse {
        state: state.lifecycle.state(),
        stats: state.lifecycle.stats(),
    }))
}

async fn list_queues(State(state): State<MonitorState>) -> MonitorResult<QueuesResponse> {
    let dashboard = state.lifecycle.inspector().dashboard().await?;
    Ok(Json(QueuesResponse {
        queues: dashboard.queues,
    }))
}

async fn queue_stats(State(state): State<MonitorState>, Path(queue): Path<String>) -> MonitorResult<QueueStats> {
    Ok(Json(state.lifecycle.inspector().queue_stats(&queue).await?))
}

async fn list_tasks(
    State(state): State<MonitorState>,
    Path(queue): Path<String>,
    Query(params): Query<TaskListParams>,
) -> MonitorResult<TaskListResponse> {
    let task_state = match params.state.as_deref() {
        None => TaskState::Pending,
        Some(s) => TaskState::from_str(s).map_err(|_| {
            MonitorError::BadRequest(format!(
                "Unknown task state '{}'; expected one of scheduled, pending, active, retry, dead",
                s
            ))
        })?,
    };

    let inspector = state.lifecycle.inspector();
    let tasks = inspector
        .list_tasks(&queue, task_state, params.offset, params.limit)
        .await?;
    let total = inspector.queue_stats(&queue).await?.count(task_state);

    Ok(Json(TaskListResponse {
        queue,
        state: task_state,
        tasks,
        total,
        offset: params.offset,
        limit: params.limit.min(courier_jobs::inspector::MAX_PAGE_SIZE),
    }))
}

async fn get_task(
    State(state): State<MonitorState>,
    Path((queue, id)): Path<(String, String)>,
) -> MonitorResult<TaskInfo> {
    let id = TaskId::from_string(id);
    Ok(Json(state.lifecycle.inspector().get_task(&queue, &id).await?))
}

async fn delete_task(
    State(state): State<MonitorState>,
    Path((queue, id)): Path<(String, String)>,
) -> MonitorResult<MessageResponse> {
    if state.readonly {
        return Err(MonitorError::ReadOnly);
    }

    let id = TaskId::from_string(id);
    state.lifecycle.inspector().delete_task(&queue, &id).await?;
    Ok(Json(MessageResponse {
        message: format!("Task {} deleted", id),
    }))
}

async fn run_task(
    State(state): State<MonitorState>,
    Path((queue, id)): Path<(String, String)>,
) -> MonitorResult<TaskInfo> {
    if state.readonly {
        return Err(MonitorError::ReadOnly);
    }

    let id = TaskId::from_string(id);
    Ok(Json(state.lifecycle.inspector().run_task(&queue, &id).await?))
}
