use std::collections::HashMap;

use tokio::sync::Mutex;

use super::state::valid_status_transition;
use super::types::Task;
use crate::error::{Error, Result};

/// Concurrency-safe registry of `Task` records keyed by ID. One exclusive
/// lock guards the whole map; reads hand out copies so callers cannot mutate
/// storage state without going back through `update`.
pub struct TaskStorage {
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskStorage {
    pub fn new() -> Self {
        TaskStorage {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.lock().await.get(id).cloned()
    }

    /// Registers a new task. Returns false (and stores nothing) if the ID
    /// already exists; this is the sole duplicate-submission guard.
    pub async fn add(&self, task: Task) -> bool {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return false;
        }
        tasks.insert(task.id.clone(), task);
        true
    }

    /// Replaces the stored record, re-validating the status transition
    /// against the currently stored status rather than any caller-held copy.
    /// On failure the stored record is left unchanged.
    pub async fn update(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let stored = tasks.get(&task.id).ok_or(Error::NotFound)?;
        if !valid_status_transition(&stored.status, &task.status) {
            return Err(Error::Request(format!(
                "invalid status transition {:?} -> {:?} for task {}",
                stored.status, task.status, task.id
            )));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Unconditional removal; callers must ensure the task is terminal first.
    pub async fn delete(&self, id: &str) {
        self.tasks.lock().await.remove(id);
    }

    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub async fn count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

impl Default for TaskStorage {
    fn default() -> Self {
        Self::new()
    }
}
