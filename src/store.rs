use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::{Namespace, Status, Task, TaskId};

/// Persistent task storage. The scheduler mirrors every applied transition
/// here and reloads non-terminal tasks from it on restart; implementations
/// own their durability and retry story.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All tasks in `namespace` whose status is one of `statuses`.
    async fn tasks_by_status(&self, namespace: &str, statuses: &[Status]) -> Result<Vec<Task>>;

    /// Persist the task's current status, message, context and timestamps.
    async fn update_status(&self, task: &Task) -> Result<()>;
}

/// Enumerates the namespaces whose tasks the scheduler owns.
#[async_trait]
pub trait NamespaceService: Send + Sync {
    async fn list(&self) -> Result<Vec<Namespace>>;
}

/// Map-backed store for embedded deployments and tests.
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
    namespaces: Vec<Namespace>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::with_namespaces(&["default"])
    }

    pub fn with_namespaces(names: &[&str]) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            namespaces: names
                .iter()
                .map(|name| Namespace {
                    name: name.to_string(),
                })
                .collect(),
        }
    }

    /// Seed a task directly, bypassing the scheduler. Used to stage restart
    /// scenarios.
    pub fn insert(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn tasks_by_status(&self, namespace: &str, statuses: &[Status]) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks
            .values()
            .filter(|task| task.id.namespace == namespace && statuses.contains(&task.status))
            .cloned()
            .collect())
    }

    async fn update_status(&self, task: &Task) -> Result<()> {
        self.tasks
            .lock()
            .unwrap()
            .insert(task.id.clone(), task.clone());
        Ok(())
    }
}

#[async_trait]
impl NamespaceService for MemoryTaskStore {
    async fn list(&self) -> Result<Vec<Namespace>> {
        Ok(self.namespaces.clone())
    }
}
