//! Task executor: dependency resolution, exactly-once execution, and the
//! completion log.
//!
//! `execute_with_dependencies` is a fold: resolve the transitive closure into
//! an ordered plan (dependencies first, the invoked task last), then thread a
//! shared context through the plan, executing each task at most once per
//! chain. Every task that actually runs appends a [`CompletedTask`] to the
//! log, whether or not anybody is listening.
//!
//! The log is the replay-capable broadcast behind `on_complete`: an
//! append-only history plus a `watch` version signal. Each subscriber scans
//! from its own cursor and then waits for the version to move, so a
//! subscription registered after the fact resolves immediately from history,
//! and one registered early resolves the moment the completion lands (there
//! is no missed-wakeup window in between).

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::context::{self, SharedTaskContext, TaskContext, ambient_context};
use crate::domain::errors::EngineError;
use crate::domain::task::{Task, TaskReference};
use crate::registry::TaskRegistry;
use crate::search::{SearchError, TreeSearch};

/// A task completion: the reference plus the context snapshot captured the
/// moment the task finished. Created once per execution, retained in the log
/// for the lifetime of the executor.
#[derive(Clone)]
pub struct CompletedTask {
    reference: TaskReference,
    context: SharedTaskContext,
    completed_at: DateTime<Utc>,
}

impl CompletedTask {
    pub(crate) fn new(reference: TaskReference, context: SharedTaskContext) -> Self {
        Self {
            reference,
            context,
            completed_at: Utc::now(),
        }
    }

    pub fn reference(&self) -> &TaskReference {
        &self.reference
    }

    /// The shared snapshot as of this task's completion.
    pub fn context(&self) -> &SharedTaskContext {
        &self.context
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

impl fmt::Debug for CompletedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedTask")
            .field("reference", &self.reference)
            .field("completed_at", &self.completed_at)
            .finish_non_exhaustive()
    }
}

/// Serializable view of one completion log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub reference: TaskReference,
    pub completed_at: DateTime<Utc>,
}

impl From<&CompletedTask> for CompletionRecord {
    fn from(completed: &CompletedTask) -> Self {
        Self {
            reference: completed.reference.clone(),
            completed_at: completed.completed_at,
        }
    }
}

/// Append-only, replayable record of every completion this executor has
/// observed.
///
/// Design:
/// - `entries` is the single source of truth; readers scan it from their own
///   cursor, so history replays to every subscriber independently.
/// - `version` only signals "the log grew". Subscribing marks the point in
///   time; an append between a reader's scan and its wait still wakes it.
/// - The entries lock is never held across an await.
struct CompletionLog {
    entries: Mutex<Vec<CompletedTask>>,
    version: watch::Sender<usize>,
}

impl CompletionLog {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: Mutex::new(Vec::new()),
            version,
        }
    }

    fn append(&self, completed: CompletedTask) {
        let len = {
            let mut entries = self.entries.lock().unwrap();
            entries.push(completed);
            entries.len()
        };
        // Signal outside the lock; send_replace works with zero receivers.
        self.version.send_replace(len);
    }

    /// Earliest log entry for `reference`, replaying history first and then
    /// waiting for new appends. Never gives up.
    async fn first_match(&self, reference: &TaskReference) -> CompletedTask {
        let mut version = self.version.subscribe();
        let mut cursor = 0;
        loop {
            {
                let entries = self.entries.lock().unwrap();
                while cursor < entries.len() {
                    let entry = &entries[cursor];
                    if entry.reference() == reference {
                        return entry.clone();
                    }
                    cursor += 1;
                }
            }
            if version.changed().await.is_err() {
                // The sender lives inside the log we are borrowing, so this
                // branch is unreachable; park forever rather than spin.
                std::future::pending::<()>().await;
            }
        }
    }

    fn records(&self) -> Vec<CompletionRecord> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(CompletionRecord::from)
            .collect()
    }
}

struct ExecutorInner {
    registry: Arc<TaskRegistry>,
    log: CompletionLog,
}

/// Orchestrates dependency resolution, exactly-once sequential execution,
/// context threading, and completion subscriptions.
///
/// Cheap to clone: all clones share the same registry and completion log.
/// The registry is injected at construction; the executor only consults it to
/// resolve dependency references into task bodies.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                registry,
                log: CompletionLog::new(),
            }),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Execute `task` after its transitive dependencies, each at most once
    /// per chain.
    ///
    /// Starts from the ambient shared context when called inside a running
    /// chain, otherwise from a fresh context bound to this executor. Returns
    /// the final snapshot of the fold: its properties reflect everything
    /// published by `task` and its dependencies.
    ///
    /// Resolution failures (unknown reference, cycle) abort before any task
    /// body runs. A failing task body aborts the rest of the plan; the
    /// completions recorded up to that point remain recorded.
    pub async fn execute_with_dependencies(
        &self,
        task: &Task,
    ) -> Result<SharedTaskContext, EngineError> {
        let plan = self.resolution_order(task).await?;
        tracing::debug!(
            task = %task.name(),
            steps = plan.len(),
            "resolved execution plan"
        );

        let mut ctx = ambient_context().unwrap_or_else(|| SharedTaskContext::new(self.clone()));
        for step in &plan {
            ctx = self.execute_once(step, ctx).await?;
        }
        Ok(ctx)
    }

    /// Flatten the dependency closure into execution order: the depth-first
    /// walk (deduplicated, latest occurrence kept) lists the root first, so
    /// everything after it, reversed, runs dependencies ahead of their
    /// dependents. The order must stay a sequence end to end; collecting it
    /// into a set would throw away what the dedupe policy just computed.
    async fn resolution_order(&self, task: &Task) -> Result<Vec<Task>, EngineError> {
        let root = task.reference();
        let registry = self.registry();

        let flattened = TreeSearch::new(root.clone(), |reference: &TaskReference| {
            if *reference == root {
                // The invoked task itself need not be registered.
                Ok(task.dependencies().to_vec())
            } else {
                registry
                    .resolve(reference)
                    .map(|found| found.dependencies().to_vec())
            }
        })
        .dedupe(true)
        .depth_first()
        .await
        .map_err(|err| match err {
            SearchError::Cycle { from, to } => EngineError::CyclicDependency { from, to },
            SearchError::Adjacency(inner) => inner,
        })?;

        let mut plan = Vec::with_capacity(flattened.len());
        for reference in flattened[1..].iter().rev() {
            plan.push(registry.resolve(reference)?);
        }
        plan.push(task.clone());
        Ok(plan)
    }

    /// One step of the fold: skip if cached, otherwise run the body in a
    /// scoped workspace and fold the result into the successor snapshot.
    async fn execute_once(
        &self,
        task: &Task,
        ctx: SharedTaskContext,
    ) -> Result<SharedTaskContext, EngineError> {
        let reference = task.reference();
        if ctx.task_cache().contains_key(&reference) {
            tracing::info!(task = %task.name(), "already completed in this context, skipping");
            return Ok(ctx);
        }

        let mut scoped = ctx.scoped(task);
        context::scope(ctx.clone(), task.run(&mut scoped)).await?;

        let snapshot = scoped.into_shared();
        let completed = CompletedTask::new(reference, snapshot.clone());
        self.inner.log.append(completed.clone());
        Ok(snapshot.with_completed(completed))
    }

    /// Run `notify` when `reference` completes.
    ///
    /// Spawns a detached waiter on the completion log: if the target already
    /// completed, history replays and `notify` runs immediately; otherwise it
    /// runs right after the completion lands. `notify` executes with the
    /// captured completion context as its ambient context, so it sees the
    /// properties the target published. No cancellation handle is provided;
    /// a waiter for a task that never runs waits forever.
    pub fn on_complete(&self, reference: TaskReference, notify: Task) {
        let executor = self.clone();
        tokio::spawn(async move {
            let completed = executor.inner.log.first_match(&reference).await;
            tracing::debug!(
                watched = %reference,
                subscriber = %notify.name(),
                "completion observed, running subscriber"
            );
            let ambient = completed.context().clone();
            if let Err(error) =
                context::scope(ambient, executor.execute_with_dependencies(&notify)).await
            {
                tracing::error!(
                    watched = %reference,
                    subscriber = %notify.name(),
                    %error,
                    "completion subscriber failed"
                );
            }
        });
    }

    /// Wait for the earliest completion of `reference`, replay-safe.
    ///
    /// This is the primitive `on_complete` is built on, exposed for callers
    /// who want to hold, select over, or time-bound the wait themselves.
    pub async fn await_completion(&self, reference: &TaskReference) -> CompletedTask {
        self.inner.log.first_match(reference).await
    }

    /// Ordered view of every completion observed so far, oldest first.
    pub fn history(&self) -> Vec<CompletionRecord> {
        self.inner.log.records()
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("registered_tasks", &self.inner.registry.len())
            .field("completions", &self.history().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ScopedTaskContext;
    use crate::domain::property::PropertyKey;
    use crate::domain::task::TaskAction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskAction for Counting {
        async fn run(&self, _ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Publish {
        key: PropertyKey<String>,
        value: &'static str,
    }

    #[async_trait]
    impl TaskAction for Publish {
        async fn run(&self, ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
            ctx.set(&self.key, self.value.to_string());
            Ok(())
        }
    }

    struct ExpectProperty {
        key: PropertyKey<String>,
        expected: &'static str,
    }

    #[async_trait]
    impl TaskAction for ExpectProperty {
        async fn run(&self, ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
            match ctx.get(&self.key) {
                Some(value) if value == self.expected => Ok(()),
                other => Err(EngineError::Other(format!(
                    "expected {:?}, got {other:?}",
                    self.expected
                ))),
            }
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskAction for Failing {
        async fn run(&self, _ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
            Err(EngineError::Other("boom".into()))
        }
    }

    /// Invokes an inner task twice through the ambient executor.
    struct InvokeTwice {
        inner: Task,
    }

    #[async_trait]
    impl TaskAction for InvokeTwice {
        async fn run(&self, _ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
            self.inner.invoke().await?;
            self.inner.invoke().await?;
            Ok(())
        }
    }

    fn executor_with(tasks: impl IntoIterator<Item = Task>) -> TaskExecutor {
        let registry = Arc::new(TaskRegistry::new());
        registry.register(tasks);
        TaskExecutor::new(registry)
    }

    fn completed_names(executor: &TaskExecutor) -> Vec<String> {
        executor
            .history()
            .into_iter()
            .map(|record| record.reference.name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn dependency_runs_before_dependent_and_its_property_is_visible() {
        let out: PropertyKey<String> = PropertyKey::named("out");
        let first = Task::named("first").with_action(Publish {
            key: out,
            value: "test",
        });
        let second = Task::named("second")
            .depends_on(first.reference())
            .with_action(ExpectProperty {
                key: out,
                expected: "test",
            });

        let executor = executor_with([first, second.clone()]);
        let ctx = executor.execute_with_dependencies(&second).await.unwrap();

        assert_eq!(ctx.get(&out).map(String::as_str), Some("test"));
        assert_eq!(completed_names(&executor), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn diamond_dependencies_execute_exactly_once() {
        //     base
        //    /    \
        //  left  right
        //    \    /
        //     root
        let hits = Arc::new(AtomicUsize::new(0));
        let base = Task::named("base").with_action(Counting { hits: hits.clone() });
        let left = Task::named("left").depends_on(base.reference());
        let right = Task::named("right").depends_on(base.reference());
        let root = Task::named("root")
            .depends_on(left.reference())
            .depends_on(right.reference());

        let executor = executor_with([base, left, right, root.clone()]);
        executor.execute_with_dependencies(&root).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // base completes once, before anything that depends on it.
        assert_eq!(completed_names(&executor)[0], "base");
        assert_eq!(executor.history().len(), 4);
    }

    #[tokio::test]
    async fn nested_invocations_hit_the_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let dep = Task::named("dep").with_action(Counting { hits: hits.clone() });
        let outer = Task::named("outer")
            .depends_on(dep.reference())
            .with_action(InvokeTwice { inner: dep.clone() });

        let executor = executor_with([dep, outer.clone()]);
        executor.execute_with_dependencies(&outer).await.unwrap();

        // dep ran as a dependency; both nested invokes were cache hits.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cycle_fails_before_anything_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let a = Task::named("a")
            .depends_on(TaskReference::new("b"))
            .with_action(Counting { hits: hits.clone() });
        let b = Task::named("b")
            .depends_on(TaskReference::new("a"))
            .with_action(Counting { hits: hits.clone() });

        let executor = executor_with([a.clone(), b]);
        let err = executor.execute_with_dependencies(&a).await.unwrap_err();

        assert!(matches!(err, EngineError::CyclicDependency { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(executor.history().is_empty());
    }

    #[tokio::test]
    async fn unresolved_dependency_aborts_resolution() {
        let hits = Arc::new(AtomicUsize::new(0));
        let root = Task::named("root")
            .depends_on(TaskReference::new("missing"))
            .with_action(Counting { hits: hits.clone() });

        let executor = executor_with([root.clone()]);
        let err = executor.execute_with_dependencies(&root).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::TaskNotFound(reference) if reference.name() == "missing"
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(executor.history().is_empty());
    }

    #[tokio::test]
    async fn independent_dependencies_each_run_once() {
        let x_hits = Arc::new(AtomicUsize::new(0));
        let y_hits = Arc::new(AtomicUsize::new(0));
        let x = Task::named("x").with_action(Counting {
            hits: x_hits.clone(),
        });
        let y = Task::named("y").with_action(Counting {
            hits: y_hits.clone(),
        });
        let root = Task::named("root")
            .depends_on(x.reference())
            .depends_on(y.reference());

        let executor = executor_with([x, y, root.clone()]);
        executor.execute_with_dependencies(&root).await.unwrap();

        assert_eq!(x_hits.load(Ordering::SeqCst), 1);
        assert_eq!(y_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_task_keeps_earlier_completions() {
        let dep = Task::named("dep");
        let root = Task::named("root")
            .depends_on(dep.reference())
            .with_action(Failing);

        let executor = executor_with([dep, root.clone()]);
        let err = executor.execute_with_dependencies(&root).await.unwrap_err();

        assert!(matches!(err, EngineError::TaskFailed { task, .. } if task == "root"));
        assert_eq!(completed_names(&executor), vec!["dep"]);
    }

    #[tokio::test]
    async fn output_async_replays_an_already_recorded_completion() {
        let out: PropertyKey<String> = PropertyKey::named("out");
        let first = Task::named("first").with_action(Publish {
            key: out,
            value: "test",
        });

        let executor = executor_with([first.clone()]);
        executor.execute_with_dependencies(&first).await.unwrap();

        // Subscribe after completion: history replay resolves it.
        let rx = first.output_async(out, &executor);
        assert_eq!(rx.await.unwrap(), "test");
    }

    #[tokio::test]
    async fn output_async_resolves_once_the_task_later_completes() {
        let out: PropertyKey<String> = PropertyKey::named("out");
        let first = Task::named("first").with_action(Publish {
            key: out,
            value: "test",
        });

        let executor = executor_with([first.clone()]);

        // Subscribe first, execute second.
        let rx = first.output_async(out, &executor);
        executor.execute_with_dependencies(&first).await.unwrap();

        assert_eq!(rx.await.unwrap(), "test");
    }

    #[tokio::test]
    async fn output_async_for_a_missing_property_closes_the_channel() {
        let out: PropertyKey<String> = PropertyKey::named("out");
        let silent = Task::named("silent");

        let executor = executor_with([silent.clone()]);
        let rx = silent.output_async(out, &executor);
        executor.execute_with_dependencies(&silent).await.unwrap();

        // Completed without the key: the sender is dropped, not left hanging.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn await_completion_returns_the_earliest_record() {
        let out: PropertyKey<String> = PropertyKey::named("out");
        let first = Task::named("first").with_action(Publish {
            key: out,
            value: "test",
        });

        let executor = executor_with([first.clone()]);
        executor.execute_with_dependencies(&first).await.unwrap();
        // Execute again in a fresh chain; the first record stays first.
        executor.execute_with_dependencies(&first).await.unwrap();

        let completed = executor.await_completion(&first.reference()).await;
        assert_eq!(completed.reference(), &first.reference());
        assert_eq!(completed.context().get(&out).map(String::as_str), Some("test"));
        assert_eq!(executor.history().len(), 2);
    }

    #[tokio::test]
    async fn invoke_outside_a_chain_is_a_missing_context_error() {
        let err = Task::named("loose").invoke().await.unwrap_err();
        assert!(matches!(err, EngineError::MissingContext(_)));
    }

    #[tokio::test]
    async fn invoking_an_unregistered_task_with_no_dependencies_works() {
        let hits = Arc::new(AtomicUsize::new(0));
        let loose = Task::named("loose").with_action(Counting { hits: hits.clone() });

        // Nothing registered at all: the invoked task itself is not looked up.
        let executor = executor_with([]);
        loose.invoke_on(&executor).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(completed_names(&executor), vec!["loose"]);
    }

    #[tokio::test]
    async fn history_serializes_to_json() {
        let first = Task::named("first");
        let executor = executor_with([first.clone()]);
        executor.execute_with_dependencies(&first).await.unwrap();

        let json = serde_json::to_value(executor.history()).unwrap();
        assert_eq!(json[0]["reference"], "first");
    }
}
