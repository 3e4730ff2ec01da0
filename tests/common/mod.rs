use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;

use flowgrid::model::{Dependency, DependencyMode, Status, Task, TaskId, TaskUpdate};
use flowgrid::queue::{Consumer, MemoryQueue, Producer};
use flowgrid::scheduler::{SchedulerConfig, TaskSchedulerService};
use flowgrid::store::MemoryTaskStore;

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;
pub const STATUS_QUEUE: &str = "status";

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        task_status_queue: STATUS_QUEUE.to_string(),
        poll_interval_ms: 10,
        task_purge_interval_secs: 3600,
    }
}

pub async fn start_service(
    queue: Arc<MemoryQueue>,
    config: SchedulerConfig,
) -> (TaskSchedulerService, Arc<MemoryTaskStore>) {
    let store = Arc::new(MemoryTaskStore::new());
    let service = TaskSchedulerService::start(
        queue.clone(),
        queue,
        store.clone(),
        store.clone(),
        config,
    )
    .await
    .expect("scheduler failed to start");
    (service, store)
}

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            task: Task::new(TaskId::new("default", "wf", "job-1", name), "test"),
        }
    }

    pub fn job(mut self, job: &str) -> Self {
        self.task.id.job = job.to_string();
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.created_at = at;
        self
    }

    pub fn created_ago(self, ago: Duration) -> Self {
        let at = Utc::now() - ago;
        self.created_at(at)
    }

    pub fn max_execution_time_ms(mut self, ms: i64) -> Self {
        self.task.max_execution_time_ms = ms;
        self
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.task
            .depends_on
            .push(Dependency::new(name, DependencyMode::All, DAY_MS));
        self
    }

    pub fn property(mut self, key: &str, value: JsonValue) -> Self {
        self.task.properties.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Scripted stand-in for the worker side of the queue.
///
/// Drains the given work queues, acknowledges every picked-up task with
/// `SUBMITTED` and `RUNNING` status messages, and reports `SUCCESSFUL`
/// immediately unless the task name is held back; held tasks wait for an
/// explicit `finish` call.
pub struct ScriptedWorker {
    queue: Arc<MemoryQueue>,
    held: Arc<Mutex<HashSet<String>>>,
    picked_up: Arc<Mutex<Vec<TaskId>>>,
    handle: JoinHandle<()>,
}

impl ScriptedWorker {
    pub fn spawn(queue: Arc<MemoryQueue>, work_queues: &[&str]) -> Self {
        let held: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let picked_up: Arc<Mutex<Vec<TaskId>>> = Arc::new(Mutex::new(Vec::new()));

        let work_queues: Vec<String> = work_queues.iter().map(|q| q.to_string()).collect();
        let loop_queue = queue.clone();
        let loop_held = held.clone();
        let loop_picked_up = picked_up.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(10));
            loop {
                ticker.tick().await;
                for work_queue in &work_queues {
                    let payloads = loop_queue.poll(work_queue).await.unwrap();
                    for raw in payloads {
                        let task: Task = serde_json::from_slice(&raw).unwrap();
                        for status in [Status::Submitted, Status::Running] {
                            send_update(&loop_queue, &task.id, status, None).await;
                        }
                        let held = loop_held.lock().unwrap().contains(&task.id.name);
                        if held {
                            loop_picked_up.lock().unwrap().push(task.id);
                        } else {
                            send_update(&loop_queue, &task.id, Status::Successful, None).await;
                        }
                    }
                }
            }
        });

        Self {
            queue,
            held,
            picked_up,
            handle,
        }
    }

    /// Keep tasks with this name running until `finish` is called for them.
    pub fn hold(&self, name: &str) {
        self.held.lock().unwrap().insert(name.to_string());
    }

    pub async fn finish(&self, name: &str) {
        self.finish_with_context(name, None).await;
    }

    pub async fn finish_with_context(&self, name: &str, context: Option<Map<String, JsonValue>>) {
        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
        let id = loop {
            let found = self
                .picked_up
                .lock()
                .unwrap()
                .iter()
                .find(|id| id.name == name)
                .cloned();
            if let Some(id) = found {
                break id;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker never picked up task '{name}'"
            );
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        };
        send_update(&self.queue, &id, Status::Successful, context).await;
    }
}

impl Drop for ScriptedWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn send_update(
    queue: &MemoryQueue,
    id: &TaskId,
    status: Status,
    context: Option<Map<String, JsonValue>>,
) {
    let update = TaskUpdate {
        task_id: id.clone(),
        status,
        status_message: None,
        context,
    };
    let payload = serde_json::to_vec(&update).unwrap();
    queue.send(STATUS_QUEUE, &payload).await.unwrap();
}

pub async fn wait_for_status(
    service: &TaskSchedulerService,
    id: &TaskId,
    status: Status,
    timeout: StdDuration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(task) = service.task(id).await.unwrap() {
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {id} stuck in {} while waiting for {status}",
                task.status
            );
        } else {
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {id} never appeared while waiting for {status}"
            );
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
}
