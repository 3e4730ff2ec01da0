use chrono::{Duration, Utc};
use log::debug;
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};

use crate::model::{Status, Task, TaskId};
use crate::scheduler::resolver;

/// In-memory indexed task graph. Exclusively owns every live `Task` record;
/// the scheduler mutates records only through `update_status` and
/// `set_properties`, and removes them only through `remove_stale_tasks`.
///
/// Indexes kept in lockstep with the primary map:
/// - `(namespace, name)` to task ids ordered by creation time, for
///   dependency resolution,
/// - forward edges to the resolved upstream instances, for readiness checks
///   and context collection,
/// - reverse edges to direct dependents, so a failure cascade walks
///   O(degree) instead of rescanning the whole map,
/// - a bucket per status, for ready/active scans and restart rehydration.
pub struct TaskProvider {
    tasks: HashMap<TaskId, Task>,
    by_name: HashMap<(String, String), Vec<TaskId>>,
    upstreams: HashMap<TaskId, Vec<TaskId>>,
    dependents: HashMap<TaskId, HashSet<TaskId>>,
    by_status: HashMap<Status, HashSet<TaskId>>,
}

impl TaskProvider {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            by_name: HashMap::new(),
            upstreams: HashMap::new(),
            dependents: HashMap::new(),
            by_status: HashMap::new(),
        }
    }

    /// Insert a task if its id is unknown. Returns false on duplicates,
    /// which are a silent no-op.
    pub fn add(&mut self, task: Task) -> bool {
        let id = task.id.clone();
        if self.tasks.contains_key(&id) {
            debug!("Task {id} already present, ignoring duplicate add");
            return false;
        }

        let key = (id.namespace.clone(), id.name.clone());
        let created = task.created_at;
        self.by_status
            .entry(task.status)
            .or_default()
            .insert(id.clone());
        self.tasks.insert(id.clone(), task);

        let tasks = &self.tasks;
        let ids = self.by_name.entry(key).or_default();
        let pos = ids
            .iter()
            .position(|existing| {
                tasks
                    .get(existing)
                    .is_some_and(|t| (t.created_at, &t.id) > (created, &id))
            })
            .unwrap_or(ids.len());
        ids.insert(pos, id);
        true
    }

    /// Resolve the task's declared dependencies to concrete upstream
    /// instances and wire both edge directions. Returns false when any
    /// dependency entry has no candidate, leaving the task without edges.
    pub fn resolve(&mut self, id: &TaskId) -> bool {
        let task = match self.tasks.get(id) {
            Some(task) => task.clone(),
            None => return false,
        };
        let resolved = match resolver::resolve_dependencies(self, &task) {
            Some(upstreams) => upstreams,
            None => return false,
        };

        // Re-resolution replaces previously wired edges
        self.unlink(id);
        for upstream in &resolved {
            self.dependents
                .entry(upstream.clone())
                .or_default()
                .insert(id.clone());
        }
        self.upstreams.insert(id.clone(), resolved);
        true
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_tasks(&self, statuses: &[Status]) -> Vec<&Task> {
        statuses
            .iter()
            .filter_map(|status| self.by_status.get(status))
            .flatten()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    pub fn get_active_tasks(&self) -> Vec<&Task> {
        self.get_tasks(&Status::ACTIVE)
    }

    /// Tasks in `WAITING` whose every upstream is `SUCCESSFUL`, ordered by
    /// creation time ascending with the id tuple breaking ties.
    pub fn get_ready_tasks(&self) -> Vec<TaskId> {
        let mut ready: Vec<&Task> = self
            .by_status
            .get(&Status::Waiting)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tasks.get(id))
            .filter(|task| self.upstreams_successful(&task.id))
            .collect();
        ready.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        ready.into_iter().map(|task| task.id.clone()).collect()
    }

    pub fn is_ready_for_execution(&self, id: &TaskId) -> bool {
        self.tasks
            .get(id)
            .is_some_and(|task| task.status == Status::Waiting)
            && self.upstreams_successful(id)
    }

    /// Direct dependents via the reverse-edge index.
    pub fn get_dependent_tasks(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents
            .get(id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolved upstream instances, in dependency declaration order.
    pub fn upstream_tasks(&self, id: &TaskId) -> &[TaskId] {
        self.upstreams.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All live tasks carrying `name` in `namespace`, in creation order.
    pub(crate) fn instances<'a>(
        &'a self,
        namespace: &str,
        name: &str,
    ) -> impl Iterator<Item = &'a Task> + 'a {
        self.by_name
            .get(&(namespace.to_string(), name.to_string()))
            .into_iter()
            .flatten()
            .filter_map(move |id| self.tasks.get(id))
    }

    /// Apply a status transition and keep the by-status bucket, timestamps,
    /// message and reported context in sync. Returns the updated record.
    pub fn update_status(
        &mut self,
        id: &TaskId,
        status: Status,
        message: Option<String>,
        context: Option<Map<String, JsonValue>>,
    ) -> Option<&Task> {
        let previous = self.tasks.get(id)?.status;
        if previous != status {
            if let Some(bucket) = self.by_status.get_mut(&previous) {
                bucket.remove(id);
            }
            self.by_status.entry(status).or_default().insert(id.clone());
        }

        let task = self.tasks.get_mut(id)?;
        task.status = status;
        if let Some(message) = message {
            task.status_message = Some(message);
        }
        if matches!(status, Status::Submitted | Status::Running) && task.submitted_at.is_none() {
            task.submitted_at = Some(Utc::now());
        }
        if status.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(Utc::now());
        }
        if let Some(context) = context {
            task.context.extend(context);
        }
        Some(&*task)
    }

    /// Replace the task's properties with their interpolated form.
    pub fn set_properties(&mut self, id: &TaskId, properties: Map<String, JsonValue>) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.properties = properties;
        }
    }

    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Evict every job whose tasks are all terminal and all older than
    /// `min_age`. Jobs go as a unit, never task by task, so no reverse edge
    /// can dangle into a half-removed job. Idempotent. Returns the number of
    /// evicted tasks.
    pub fn remove_stale_tasks(&mut self, min_age: Duration) -> usize {
        let horizon = Utc::now() - min_age;

        let mut jobs: HashMap<(String, String, String), bool> = HashMap::new();
        for task in self.tasks.values() {
            let evictable = task.status.is_terminal() && task.created_at <= horizon;
            jobs.entry(job_key(&task.id))
                .and_modify(|all| *all &= evictable)
                .or_insert(evictable);
        }

        let stale: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| jobs.get(&job_key(&task.id)).copied().unwrap_or(false))
            .map(|task| task.id.clone())
            .collect();
        for id in &stale {
            debug!("Evicting stale task {id}");
            self.remove(id);
        }
        stale.len()
    }

    fn upstreams_successful(&self, id: &TaskId) -> bool {
        self.upstreams.get(id).into_iter().flatten().all(|up| {
            self.tasks
                .get(up)
                .is_some_and(|task| task.status == Status::Successful)
        })
    }

    fn unlink(&mut self, id: &TaskId) {
        if let Some(previous) = self.upstreams.remove(id) {
            for upstream in previous {
                if let Some(deps) = self.dependents.get_mut(&upstream) {
                    deps.remove(id);
                    if deps.is_empty() {
                        self.dependents.remove(&upstream);
                    }
                }
            }
        }
    }

    fn remove(&mut self, id: &TaskId) {
        let task = match self.tasks.remove(id) {
            Some(task) => task,
            None => return,
        };
        if let Some(bucket) = self.by_status.get_mut(&task.status) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.by_status.remove(&task.status);
            }
        }
        let key = (id.namespace.clone(), id.name.clone());
        if let Some(ids) = self.by_name.get_mut(&key) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.by_name.remove(&key);
            }
        }
        self.unlink(id);
        if let Some(deps) = self.dependents.remove(id) {
            for dep in deps {
                if let Some(ups) = self.upstreams.get_mut(&dep) {
                    ups.retain(|existing| existing != id);
                }
            }
        }
    }
}

impl Default for TaskProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn job_key(id: &TaskId) -> (String, String, String) {
    (
        id.namespace.clone(),
        id.workflow.clone(),
        id.job.clone(),
    )
}
