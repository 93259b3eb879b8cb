use thiserror::Error;

use super::task::TaskReference;

/// Engine error taxonomy.
///
/// All of these are fatal for the call that triggered them; the engine never
/// retries on its own. Completions recorded before the failure stay recorded
/// (no rollback).
#[derive(Debug, Error)]
pub enum EngineError {
    /// A dependency reference has no matching registry entry.
    #[error("task '{0}' not found in registry")]
    TaskNotFound(TaskReference),

    /// Dependency resolution walked into a cycle. Reported with the offending
    /// edge, before any task body has run.
    #[error("cyclic dependency detected at {from} -> {to}")]
    CyclicDependency {
        from: TaskReference,
        to: TaskReference,
    },

    /// An operation that needs an active execution context was called outside
    /// of one. Usage error in the embedding code.
    #[error("no ambient task context: {0} must be called inside a running task")]
    MissingContext(&'static str),

    /// A task action returned an error; the chain aborts here.
    #[error("task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("{0}")]
    Other(String),
}
