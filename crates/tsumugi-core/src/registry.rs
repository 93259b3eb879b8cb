//! Task registry: name -> definition lookup.
//!
//! The registry is an explicit value injected into the executor at
//! construction time; there is no process-global default. Build it, register
//! tasks, hand it to as many executors as you like ("register once, execute
//! many times").
//!
//! Design:
//! - Reads dominate (one lookup per dependency per resolution), so the table
//!   sits behind an `RwLock`. The lock is never held across an await.
//! - Registration is append-mostly; re-registering a name silently replaces
//!   the previous definition (last wins).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::errors::EngineError;
use crate::domain::task::{Task, TaskReference};

/// Mapping from [`TaskReference`] to [`Task`].
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskReference, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-register tasks, keyed by their name-derived reference.
    ///
    /// Duplicate names overwrite silently: the last registration wins.
    pub fn register(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut table = self.tasks.write().unwrap();
        for task in tasks {
            table.insert(task.reference(), task);
        }
    }

    pub fn get(&self, reference: &TaskReference) -> Option<Task> {
        self.tasks.read().unwrap().get(reference).cloned()
    }

    /// Lookup that treats a missing entry as the configuration error it is.
    pub fn resolve(&self, reference: &TaskReference) -> Result<Task, EngineError> {
        self.get(reference)
            .ok_or_else(|| EngineError::TaskNotFound(reference.clone()))
    }

    pub fn contains(&self, reference: &TaskReference) -> bool {
        self.tasks.read().unwrap().contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().unwrap().is_empty()
    }
}
