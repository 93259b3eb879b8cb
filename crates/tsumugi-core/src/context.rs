//! Execution contexts and the ambient carrier.
//!
//! Two flavors, one read surface:
//! - [`SharedTaskContext`]: immutable snapshot of an execution chain:
//!   executor handle, completed-task cache, property snapshot. Never mutated
//!   after construction; every step of the chain produces a successor value.
//!   Cloning is cheap (handle + `Arc`-backed maps), so many holders of the
//!   same snapshot are always safe.
//! - [`ScopedTaskContext`]: mutable workspace owned by exactly one running
//!   task. It starts as a private copy of the chain's properties; whatever
//!   the task writes becomes the next shared snapshot only when the engine
//!   folds it back in at completion.
//!
//! The ambient carrier is a `tokio::task_local!` scope: the executor wraps
//! each task body (and each completion subscriber) in the current shared
//! snapshot, so nested asynchronous work inherits the chain implicitly
//! without threading an extra parameter through every call.

use std::collections::HashMap;
use std::fmt;

use crate::domain::property::{PropertyKey, PropertySet};
use crate::domain::task::{Task, TaskReference};
use crate::executor::{CompletedTask, TaskExecutor};

/// Cache of completed tasks within one execution chain. A reference present
/// here is never executed again in that chain.
pub type TaskCache = HashMap<TaskReference, CompletedTask>;

/// Common read surface of both context flavors.
pub trait TaskContext {
    fn executor(&self) -> &TaskExecutor;
    fn task_cache(&self) -> &TaskCache;
    fn properties(&self) -> &PropertySet;

    /// Type-checked property lookup.
    fn get<T: Send + Sync + 'static>(&self, key: &PropertyKey<T>) -> Option<&T> {
        self.properties().get(key)
    }
}

/// Immutable snapshot threaded through an execution chain.
#[derive(Clone)]
pub struct SharedTaskContext {
    executor: TaskExecutor,
    task_cache: TaskCache,
    properties: PropertySet,
}

impl SharedTaskContext {
    /// Fresh context bound to `executor`: empty cache, empty properties.
    pub(crate) fn new(executor: TaskExecutor) -> Self {
        Self {
            executor,
            task_cache: TaskCache::new(),
            properties: PropertySet::new(),
        }
    }

    /// Derive the private workspace handed to one invocation of `task`.
    pub(crate) fn scoped(&self, task: &Task) -> ScopedTaskContext {
        ScopedTaskContext {
            task: task.reference(),
            executor: self.executor.clone(),
            task_cache: self.task_cache.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Successor snapshot whose cache additionally holds `completed`.
    pub(crate) fn with_completed(&self, completed: CompletedTask) -> Self {
        let mut next = self.clone();
        next.task_cache
            .insert(completed.reference().clone(), completed);
        next
    }
}

impl TaskContext for SharedTaskContext {
    fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    fn task_cache(&self) -> &TaskCache {
        &self.task_cache
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }
}

impl fmt::Debug for SharedTaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut completed: Vec<&str> = self
            .task_cache
            .keys()
            .map(TaskReference::name)
            .collect();
        completed.sort_unstable();
        f.debug_struct("SharedTaskContext")
            .field("completed", &completed)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Mutable workspace owned by a single task invocation.
pub struct ScopedTaskContext {
    task: TaskReference,
    executor: TaskExecutor,
    task_cache: TaskCache,
    properties: PropertySet,
}

impl ScopedTaskContext {
    /// The task this workspace belongs to.
    pub fn task(&self) -> &TaskReference {
        &self.task
    }

    /// Publish a property for downstream tasks. Local until this task
    /// completes.
    pub fn set<T: Send + Sync + 'static>(&mut self, key: &PropertyKey<T>, value: T) {
        self.properties.insert(key, value);
    }

    /// Collapse the workspace into the shared snapshot that seeds the rest of
    /// the chain.
    pub(crate) fn into_shared(self) -> SharedTaskContext {
        SharedTaskContext {
            executor: self.executor,
            task_cache: self.task_cache,
            properties: self.properties,
        }
    }
}

impl TaskContext for ScopedTaskContext {
    fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    fn task_cache(&self) -> &TaskCache {
        &self.task_cache
    }

    fn properties(&self) -> &PropertySet {
        &self.properties
    }
}

impl fmt::Debug for ScopedTaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedTaskContext")
            .field("task", &self.task)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

tokio::task_local! {
    static TASK_CONTEXT: SharedTaskContext;
}

/// Snapshot of the ambient execution context, if any.
///
/// `None` outside of a running chain. Operations that cannot work without a
/// context (e.g. [`Task::invoke`]) turn that into
/// [`EngineError::MissingContext`](crate::domain::errors::EngineError).
pub fn ambient_context() -> Option<SharedTaskContext> {
    TASK_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Run `future` with `ctx` as the ambient context.
pub(crate) async fn scope<F>(ctx: SharedTaskContext, future: F) -> F::Output
where
    F: std::future::Future,
{
    TASK_CONTEXT.scope(ctx, future).await
}
