//! Task type to handler routing.

use crate::error::TaskError;
use crate::task::{Task, TaskContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Handler for one task type.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process a task. Returning an error counts as a failed attempt.
    async fn process(&self, ctx: TaskContext, task: Task) -> Result<(), TaskError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn process(&self, ctx: TaskContext, task: Task) -> Result<(), TaskError> {
        (self.0)(ctx, task).await
    }
}

/// Immutable handler table used by a running pool.
#[derive(Clone, Default)]
pub struct FrozenRegistry {
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
}

impl FrozenRegistry {
    /// Looks up the handler for a task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Arc<dyn Handler>>,
    frozen: Option<FrozenRegistry>,
}

/// Mutable handler registry, frozen when the worker pool starts.
#[derive(Default)]
pub struct TaskRegistry {
    state: RwLock<RegistryState>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `task_type`.
    ///
    /// A second registration for the same type replaces the first. Returns
    /// `false` if the registry is already frozen, in which case nothing changes.
    pub fn handle(&self, task_type: impl Into<String>, handler: impl Handler) -> bool {
        self.insert(task_type.into(), Arc::new(handler))
    }

    /// Registers an async closure as the handler for `task_type`.
    pub fn handle_fn<F, Fut>(&self, task_type: impl Into<String>, f: F) -> bool
    where
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.insert(task_type.into(), Arc::new(FnHandler(f)))
    }

    fn insert(&self, task_type: String, handler: Arc<dyn Handler>) -> bool {
        let mut state = self.state.write();

        if state.frozen.is_some() {
            warn!(task_type = %task_type, "Worker pool already started; handler registration ignored");
            return false;
        }

        if state.handlers.insert(task_type.clone(), handler).is_some() {
            warn!(task_type = %task_type, "Handler replaced by a later registration");
        } else {
            info!(task_type = %task_type, "Registered task handler");
        }
        true
    }

    /// Freezes the registry and returns the handler table.
    ///
    /// Repeated calls return the same table.
    pub fn freeze(&self) -> FrozenRegistry {
        let mut state = self.state.write();
        if let Some(frozen) = &state.frozen {
            return frozen.clone();
        }

        let frozen = FrozenRegistry {
            handlers: Arc::new(state.handlers.clone()),
        };
        state.frozen = Some(frozen.clone());
        frozen
    }

    /// Returns true once the registry has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen.is_some()
    }

    /// Returns true if a handler exists for `task_type`.
    pub fn contains(&self, task_type: &str) -> bool {
        self.state.read().handlers.contains_key(task_type)
    }
}
