//! Task and TaskReference value objects.
//!
//! A [`Task`] is an immutable unit of work: a name, the references it depends
//! on, and an async action. Combinators (`depends_on`, `renamed`,
//! `with_action`) produce new `Task` values; nothing mutates in place, so a
//! task handed to a registry can never change under it.
//!
//! [`TaskReference`] is the lightweight name wrapper used everywhere a task is
//! mentioned without needing its body: dependency declarations, registry
//! lookups, cache keys, completion records. Declaring a dependency on a
//! reference works before the referenced task is even defined.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::context::{ScopedTaskContext, SharedTaskContext, TaskContext, ambient_context};
use crate::domain::errors::EngineError;
use crate::domain::property::PropertyKey;
use crate::executor::TaskExecutor;

/// Lightweight identifier for a task (wraps the task name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskReference(String);

impl TaskReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The executable body of a task.
///
/// Actions receive an exclusively-owned [`ScopedTaskContext`]: a private copy
/// of the chain's properties they may read and write freely, plus read access
/// to the completion cache and the executor handle. Writes become visible to
/// downstream tasks only once the action returns and the engine folds the
/// scoped properties back into the chain.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self, ctx: &mut ScopedTaskContext) -> Result<(), EngineError>;
}

/// Default action: do nothing. Useful for pure aggregation tasks that exist
/// only to fan in dependencies.
struct NoopAction;

#[async_trait]
impl TaskAction for NoopAction {
    async fn run(&self, _ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Immutable unit of work: name + dependency references + action.
#[derive(Clone)]
pub struct Task {
    name: String,
    depends_on: Vec<TaskReference>,
    action: Arc<dyn TaskAction>,
}

impl Task {
    /// Anonymous task with a random 16-character base62 name and a no-op
    /// action.
    pub fn new() -> Self {
        Self::named(random_task_name())
    }

    /// Task with the given name and a no-op action.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            action: Arc::new(NoopAction),
        }
    }

    /// New task value with the given action.
    pub fn with_action(mut self, action: impl TaskAction + 'static) -> Self {
        self.action = Arc::new(action);
        self
    }

    /// New task value with a different name (and therefore a different
    /// reference).
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// New task value that additionally depends on `reference`.
    ///
    /// Declaration order is preserved; it is the order dependencies are
    /// discovered in, which keeps resolution deterministic. Re-declaring an
    /// existing dependency is a no-op.
    pub fn depends_on(mut self, reference: TaskReference) -> Self {
        if !self.depends_on.contains(&reference) {
            self.depends_on.push(reference);
        }
        self
    }

    /// New task value depending on every reference in `references`.
    pub fn depends_on_all(self, references: impl IntoIterator<Item = TaskReference>) -> Self {
        references
            .into_iter()
            .fold(self, |task, reference| task.depends_on(reference))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference(&self) -> TaskReference {
        TaskReference::new(self.name.clone())
    }

    pub fn dependencies(&self) -> &[TaskReference] {
        &self.depends_on
    }

    /// Run the action, tagging any failure with this task's name.
    pub(crate) async fn run(&self, ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
        self.action
            .run(ctx)
            .await
            .map_err(|source| EngineError::TaskFailed {
                task: self.name.clone(),
                message: source.to_string(),
            })
    }

    /// Execute this task (with dependencies) on the ambient executor.
    ///
    /// Only valid inside a running task; use [`Task::invoke_on`] from the
    /// outside.
    pub async fn invoke(&self) -> Result<SharedTaskContext, EngineError> {
        let ctx = ambient_context().ok_or(EngineError::MissingContext("Task::invoke"))?;
        let executor = ctx.executor().clone();
        executor.execute_with_dependencies(self).await
    }

    /// Execute this task (with dependencies) on an explicit executor.
    pub async fn invoke_on(&self, executor: &TaskExecutor) -> Result<SharedTaskContext, EngineError> {
        executor.execute_with_dependencies(self).await
    }

    /// Single-assignment future for a typed property of this task's output.
    ///
    /// Registers an anonymous completion subscriber for this task's
    /// reference; when the task completes (the completion log replays
    /// history, so an earlier completion counts), the subscriber reads `key`
    /// from the captured context and fulfills the returned receiver.
    ///
    /// If the completed context does not contain `key`, the sender is dropped
    /// and the receiver resolves to a closed-channel error: "completed
    /// without this output" is distinguishable from "not completed yet"
    /// (still pending).
    pub fn output_async<T>(
        &self,
        key: PropertyKey<T>,
        executor: &TaskExecutor,
    ) -> oneshot::Receiver<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let probe = Task::new().with_action(OutputProbe {
            key,
            slot: Mutex::new(Some(tx)),
        });
        executor.on_complete(self.reference(), probe);
        rx
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Completion subscriber backing [`Task::output_async`]: reads one property
/// out of the completed context and resolves the oneshot, once.
struct OutputProbe<T> {
    key: PropertyKey<T>,
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

#[async_trait]
impl<T> TaskAction for OutputProbe<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(&self, ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
        if let Some(value) = ctx.get(&self.key)
            && let Some(tx) = self.slot.lock().unwrap().take()
        {
            // Receiver may already be gone; nothing to report either way.
            let _ = tx.send(value.clone());
        }
        Ok(())
    }
}

fn random_task_name() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
