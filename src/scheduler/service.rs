use anyhow::{anyhow, Result};
use chrono::Duration as ChronoDuration;
use log::{debug, error, info, warn};
use serde_json::{Map, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::model::{Status, Task, TaskId, TaskUpdate};
use crate::queue::{Consumer, Producer};
use crate::scheduler::context;
use crate::scheduler::provider::TaskProvider;
use crate::scheduler::timeout::TimeoutManager;
use crate::store::{NamespaceService, TaskStore};
use crate::{FAILED_TO_RESOLVE_DEPENDENCY, TASK_SUBMISSION_FAILED, TIMED_OUT};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Queue the inbound status poller drains.
    pub task_status_queue: String,
    pub poll_interval_ms: u64,
    /// Purge sweep period; doubles as the minimum age before a terminated
    /// job is evicted from memory.
    pub task_purge_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_status_queue: std::env::var("FLOWGRID_TASK_STATUS_QUEUE")
                .unwrap_or_else(|_| "task-status".to_string()),
            poll_interval_ms: std::env::var("FLOWGRID_STATUS_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
            task_purge_interval_secs: std::env::var("FLOWGRID_TASK_PURGE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3600),
        }
    }
}

enum SchedulerCommand {
    Submit {
        task: Box<Task>,
        respond_to: oneshot::Sender<bool>,
    },
    UpdateStatus {
        task_id: TaskId,
        status: Status,
        message: Option<String>,
        context: Option<Map<String, JsonValue>>,
        respond_to: Option<oneshot::Sender<()>>,
    },
    DeleteStale {
        respond_to: Option<oneshot::Sender<()>>,
    },
    GetTask {
        task_id: TaskId,
        respond_to: oneshot::Sender<Option<Task>>,
    },
    Size {
        respond_to: oneshot::Sender<usize>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// The scheduling core. Resolves dependencies for every submitted task,
/// dispatches ready tasks to the outbound queue and consumes worker status
/// updates from the inbound queue.
///
/// All state lives behind a command loop. Submissions, status updates,
/// timeout firings and the stale sweep are commands processed to completion
/// before the next one, which serializes the task graph exactly like a
/// scheduler-wide lock would: a failure cascade finishes before any
/// dependent could be dispatched, and status updates for one task apply in
/// arrival order.
pub struct TaskSchedulerService {
    sender: mpsc::Sender<SchedulerCommand>,
    consumer: Arc<dyn Consumer>,
    poller: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl TaskSchedulerService {
    /// Recover state from the task store, then begin serving: spawns the
    /// command loop, the inbound status poller and the periodic purge sweep.
    pub async fn start(
        producer: Arc<dyn Producer>,
        consumer: Arc<dyn Consumer>,
        store: Arc<dyn TaskStore>,
        namespaces: Arc<dyn NamespaceService>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        info!("Starting task scheduler service");
        let (sender, mut receiver) = mpsc::channel(1024);

        let mut state = SchedulerState {
            provider: TaskProvider::new(),
            producer,
            store,
            timeouts: TimeoutManager::new(),
            tx: sender.clone(),
            purge_min_age: ChronoDuration::seconds(config.task_purge_interval_secs as i64),
        };
        state.recover(namespaces.as_ref()).await?;

        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    SchedulerCommand::Submit { task, respond_to } => {
                        let added = state.submit(*task).await;
                        let _ = respond_to.send(added);
                    }
                    SchedulerCommand::UpdateStatus {
                        task_id,
                        status,
                        message,
                        context,
                        respond_to,
                    } => {
                        state.update_status(task_id, status, message, context).await;
                        if let Some(respond_to) = respond_to {
                            let _ = respond_to.send(());
                        }
                    }
                    SchedulerCommand::DeleteStale { respond_to } => {
                        state.delete_stale();
                        if let Some(respond_to) = respond_to {
                            let _ = respond_to.send(());
                        }
                    }
                    SchedulerCommand::GetTask {
                        task_id,
                        respond_to,
                    } => {
                        let _ = respond_to.send(state.provider.get_task(&task_id).cloned());
                    }
                    SchedulerCommand::Size { respond_to } => {
                        let _ = respond_to.send(state.provider.size());
                    }
                    SchedulerCommand::Shutdown { respond_to } => {
                        state.shutdown().await;
                        let _ = respond_to.send(());
                        break;
                    }
                }
            }
            info!("Task scheduler command loop stopped");
        });

        let poller = tokio::spawn(Self::run_status_poller(
            consumer.clone(),
            sender.clone(),
            config.task_status_queue.clone(),
            Duration::from_millis(config.poll_interval_ms.max(1)),
        ));
        let sweeper = tokio::spawn(Self::run_purge_sweeper(
            sender.clone(),
            Duration::from_secs(config.task_purge_interval_secs.max(1)),
        ));

        Ok(Self {
            sender,
            consumer,
            poller,
            sweeper,
        })
    }

    /// Accept a task. Returns false when the id is already known (a silent
    /// no-op); otherwise the task has completed its initial transitions,
    /// possibly all the way to `SCHEDULED` or `FAILED`, by the time this
    /// returns.
    pub async fn submit(&self, task: Task) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::Submit {
            task: Box::new(task),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("scheduler dropped the submission"))
    }

    /// Apply a status transition, as reported by a worker or an internal
    /// subsystem. Unknown ids and updates against terminal tasks are logged
    /// and ignored.
    pub async fn update_status(
        &self,
        task_id: TaskId,
        status: Status,
        message: Option<String>,
        context: Option<Map<String, JsonValue>>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::UpdateStatus {
            task_id,
            status,
            message,
            context,
            respond_to: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| anyhow!("scheduler dropped the update"))
    }

    /// Evict every job whose tasks all reached a terminal state longer than
    /// the configured purge interval ago.
    pub async fn delete_stale_tasks(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::DeleteStale {
            respond_to: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| anyhow!("scheduler dropped the sweep"))
    }

    pub async fn task(&self, id: &TaskId) -> Result<Option<Task>> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::GetTask {
            task_id: id.clone(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("scheduler dropped the query"))
    }

    pub async fn size(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::Size { respond_to: tx }).await?;
        rx.await.map_err(|_| anyhow!("scheduler dropped the query"))
    }

    /// Stop serving: cancels all timers, stops the poller and the sweeper,
    /// drains the command loop with a 10 second grace and closes both queue
    /// endpoints.
    pub async fn stop(self) -> Result<()> {
        info!("Stopping task scheduler service");
        self.poller.abort();
        self.sweeper.abort();

        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SchedulerCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
            && tokio::time::timeout(Duration::from_secs(10), rx).await.is_err()
        {
            error!("Timed out waiting for the scheduler loop to drain");
        }

        if let Err(e) = self.consumer.close().await {
            error!("Error closing status queue consumer: {e:#}");
        }
        Ok(())
    }

    async fn send(&self, command: SchedulerCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| anyhow!("scheduler is not running"))
    }

    async fn run_status_poller(
        consumer: Arc<dyn Consumer>,
        tx: mpsc::Sender<SchedulerCommand>,
        queue: String,
        poll_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let messages = match consumer.poll(&queue).await {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Error polling status queue '{queue}': {e:#}");
                    continue;
                }
            };
            for raw in messages {
                let update: TaskUpdate = match serde_json::from_slice(&raw) {
                    Ok(update) => update,
                    Err(e) => {
                        error!(
                            "Error parsing task status message {}: {e}",
                            String::from_utf8_lossy(&raw)
                        );
                        continue;
                    }
                };
                let command = SchedulerCommand::UpdateStatus {
                    task_id: update.task_id,
                    status: update.status,
                    message: update.status_message,
                    context: update.context,
                    respond_to: None,
                };
                if tx.send(command).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn run_purge_sweeper(tx: mpsc::Sender<SchedulerCommand>, every: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticker.tick().await;
            if tx
                .send(SchedulerCommand::DeleteStale { respond_to: None })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

struct SchedulerState {
    provider: TaskProvider,
    producer: Arc<dyn Producer>,
    store: Arc<dyn TaskStore>,
    timeouts: TimeoutManager,
    /// Sender back into the command loop; timers enqueue their firing here.
    tx: mpsc::Sender<SchedulerCommand>,
    purge_min_age: ChronoDuration,
}

impl SchedulerState {
    /// Rebuild the in-memory graph from the task store: insert every
    /// non-terminal task in creation order, re-wire dependency edges, re-arm
    /// timers for in-flight tasks and dispatch whatever became ready.
    async fn recover(&mut self, namespaces: &dyn NamespaceService) -> Result<()> {
        let mut tasks = Vec::new();
        for namespace in namespaces.list().await? {
            tasks.extend(
                self.store
                    .tasks_by_status(&namespace.name, &Status::ACTIVE)
                    .await?,
            );
        }
        if tasks.is_empty() {
            return Ok(());
        }
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        info!("Rehydrating {} active tasks from the task store", tasks.len());

        let mut loaded = Vec::new();
        for task in tasks {
            let id = task.id.clone();
            let status = task.status;
            if self.provider.add(task) {
                loaded.push((id, status));
            }
        }

        for (id, status) in &loaded {
            if self.provider.resolve(id) {
                if *status == Status::Created {
                    self.update_status(id.clone(), Status::Waiting, None, None)
                        .await;
                }
            } else {
                match status {
                    Status::Created | Status::Waiting => {
                        error!(
                            "Unable to re-resolve dependencies for task {id}, marking it as {}",
                            Status::Failed
                        );
                        self.update_status(
                            id.clone(),
                            Status::Failed,
                            Some(FAILED_TO_RESOLVE_DEPENDENCY.to_string()),
                            None,
                        )
                        .await;
                    }
                    _ => warn!(
                        "Dependencies of in-flight task {id} no longer resolve, \
                         leaving it to its worker"
                    ),
                }
            }
        }

        for (id, status) in &loaded {
            if matches!(status, Status::Submitted | Status::Running)
                && self
                    .provider
                    .get_task(id)
                    .is_some_and(|task| !task.status.is_terminal())
            {
                self.arm_timeout(id);
            }
        }

        self.schedule_ready().await;
        Ok(())
    }

    async fn submit(&mut self, task: Task) -> bool {
        info!("Received request to schedule task {}", task.id);
        let id = task.id.clone();
        if !self.provider.add(task) {
            return false;
        }
        self.resolve(&id).await;
        true
    }

    async fn resolve(&mut self, id: &TaskId) {
        if self.provider.resolve(id) {
            self.update_status(id.clone(), Status::Waiting, None, None)
                .await;
        } else {
            error!(
                "Unable to resolve dependencies for task {id}, marking it as {}",
                Status::Failed
            );
            self.update_status(
                id.clone(),
                Status::Failed,
                Some(FAILED_TO_RESOLVE_DEPENDENCY.to_string()),
                None,
            )
            .await;
        }
    }

    async fn update_status(
        &mut self,
        id: TaskId,
        status: Status,
        message: Option<String>,
        context: Option<Map<String, JsonValue>>,
    ) {
        let current = match self.provider.get_task(&id) {
            Some(task) => task.status,
            None => {
                error!("No task found with id {id}");
                return;
            }
        };
        if current.is_terminal() {
            debug!("Task {id} is already {current}, dropping update to {status}");
            return;
        }

        self.apply(&id, status, message, context).await;

        match status {
            Status::Waiting => self.schedule_ready().await,
            Status::Submitted => self.arm_timeout(&id),
            Status::Running => {
                // a worker may skip the SUBMITTED ack; the deadline still
                // has to exist while the task runs
                self.arm_timeout(&id);
            }
            Status::Successful => {
                self.timeouts.cancel(&id);
                self.schedule_ready().await;
            }
            Status::Failed => {
                self.timeouts.cancel(&id);
                self.fail_dependents(&id).await;
                self.schedule_ready().await;
            }
            Status::Created | Status::Scheduled => {}
        }
    }

    /// Apply one transition to the provider and mirror it to the store.
    async fn apply(
        &mut self,
        id: &TaskId,
        status: Status,
        message: Option<String>,
        context: Option<Map<String, JsonValue>>,
    ) {
        info!(
            "Updating status of task {id} to {status}{}",
            message
                .as_deref()
                .map(|m| format!(" with status message {m}"))
                .unwrap_or_default()
        );
        if let Some(task) = self.provider.update_status(id, status, message, context) {
            if let Err(e) = self.store.update_status(task).await {
                error!("Error persisting status of task {id}: {e:#}");
            }
        }
    }

    /// Move every task transitively depending on `id` to `FAILED`, walking
    /// the reverse-edge index. Runs to completion before anything else can
    /// be dispatched.
    async fn fail_dependents(&mut self, id: &TaskId) {
        let mut pending = VecDeque::from(self.provider.get_dependent_tasks(id));
        while let Some(dependent) = pending.pop_front() {
            let terminal = self
                .provider
                .get_task(&dependent)
                .is_none_or(|task| task.status.is_terminal());
            if terminal {
                continue;
            }
            self.timeouts.cancel(&dependent);
            self.apply(
                &dependent,
                Status::Failed,
                Some(FAILED_TO_RESOLVE_DEPENDENCY.to_string()),
                None,
            )
            .await;
            pending.extend(self.provider.get_dependent_tasks(&dependent));
        }
    }

    /// Dispatch every ready task: interpolate its properties from upstream
    /// context, serialize it and send it to the queue named after its type.
    async fn schedule_ready(&mut self) {
        for id in self.provider.get_ready_tasks() {
            let (task_type, properties) = {
                let Some(task) = self.provider.get_task(&id) else {
                    continue;
                };
                // an earlier iteration of this batch may have failed it
                if task.status != Status::Waiting {
                    continue;
                }
                let flat = context::collect_upstream_context(&self.provider, task);
                (
                    task.task_type.clone(),
                    context::interpolate_properties(&task.properties, &flat),
                )
            };
            self.provider.set_properties(&id, properties);

            let payload = match self.provider.get_task(&id) {
                Some(task) => serde_json::to_vec(task).map_err(anyhow::Error::from),
                None => continue,
            };
            let sent = match payload {
                Ok(bytes) => self.producer.send(&task_type, &bytes).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => self.apply(&id, Status::Scheduled, None, None).await,
                Err(e) => {
                    error!("Error submitting task {id} to queue '{task_type}': {e:#}");
                    self.apply(
                        &id,
                        Status::Failed,
                        Some(TASK_SUBMISSION_FAILED.to_string()),
                        None,
                    )
                    .await;
                    self.fail_dependents(&id).await;
                }
            }
        }
    }

    fn arm_timeout(&mut self, id: &TaskId) {
        let deadline = {
            let Some(task) = self.provider.get_task(id) else {
                return;
            };
            task.submitted_at.unwrap_or(task.created_at)
                + ChronoDuration::milliseconds(task.max_execution_time_ms)
        };

        let tx = self.tx.clone();
        let task_id = id.clone();
        self.timeouts.arm(id, deadline, async move {
            info!("Task {task_id} exceeded its maximum execution time, marking it as failed");
            let command = SchedulerCommand::UpdateStatus {
                task_id: task_id.clone(),
                status: Status::Failed,
                message: Some(TIMED_OUT.to_string()),
                context: None,
                respond_to: None,
            };
            if tx.send(command).await.is_err() {
                warn!("Scheduler already stopped, dropping timeout for task {task_id}");
            }
        });
    }

    fn delete_stale(&mut self) {
        let removed = self.provider.remove_stale_tasks(self.purge_min_age);
        if removed > 0 {
            info!("Purged {removed} stale tasks from memory");
        }
    }

    async fn shutdown(&mut self) {
        self.timeouts.cancel_all();
        if let Err(e) = self.producer.close().await {
            error!("Error closing task queue producer: {e:#}");
        }
    }
}
