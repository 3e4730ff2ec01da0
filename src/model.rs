use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Identity of a task. All four parts together form the globally unique id;
/// the derived `Ord` (namespace, workflow, job, name) is the tie-breaker used
/// wherever a deterministic order is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub namespace: String,
    pub workflow: String,
    pub job: String,
    pub name: String,
}

impl TaskId {
    pub fn new(namespace: &str, workflow: &str, job: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            workflow: workflow.to_string(),
            job: job.to_string(),
            name: name.to_string(),
        }
    }

    /// The job scope shared by sibling tasks. Dependencies never cross it and
    /// eviction treats it as one unit.
    pub fn job_scope(&self) -> (&str, &str, &str) {
        (&self.namespace, &self.workflow, &self.job)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.workflow, self.job, self.name
        )
    }
}

/// Task lifecycle status. `Successful` and `Failed` are terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Created,
    Waiting,
    Scheduled,
    Submitted,
    Running,
    Successful,
    Failed,
}

impl Status {
    /// Every non-terminal status, in lifecycle order. Used to rehydrate the
    /// scheduler from the task store on restart.
    pub const ACTIVE: [Status; 5] = [
        Status::Created,
        Status::Waiting,
        Status::Scheduled,
        Status::Submitted,
        Status::Running,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Successful | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Created => "CREATED",
            Status::Waiting => "WAITING",
            Status::Scheduled => "SCHEDULED",
            Status::Submitted => "SUBMITTED",
            Status::Running => "RUNNING",
            Status::Successful => "SUCCESSFUL",
            Status::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Selector over the concrete upstream instances that fall inside the
/// look-back window of a dependency declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyMode {
    #[default]
    All,
    First,
    Last,
}

/// A declared dependency on an upstream task name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub mode: DependencyMode,
    /// How far back from the task's own `created_at` to look for upstream
    /// instances.
    #[serde(default = "default_lookback_window_ms")]
    pub lookback_window_ms: i64,
}

impl Dependency {
    pub fn new(name: &str, mode: DependencyMode, lookback_window_ms: i64) -> Self {
        Self {
            name: name.to_string(),
            mode,
            lookback_window_ms,
        }
    }
}

fn default_lookback_window_ms() -> i64 {
    24 * 60 * 60 * 1000
}

fn default_max_execution_time_ms() -> i64 {
    24 * 60 * 60 * 1000
}

fn default_status() -> Status {
    Status::Created
}

/// A unit of work submitted to the scheduler.
///
/// Timestamps travel as epoch milliseconds on the wire. `properties` is
/// author-supplied input to the handler and may contain `${...}` placeholders
/// resolved from upstream context just before dispatch; `context` is the
/// output a worker reports back on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(flatten)]
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: i64,
    #[serde(default)]
    pub depends_on: Vec<Dependency>,
    #[serde(default)]
    pub properties: Map<String, JsonValue>,
    #[serde(default)]
    pub context: Map<String, JsonValue>,
    #[serde(default = "default_status")]
    pub status: Status,
    #[serde(default)]
    pub status_message: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, task_type: &str) -> Self {
        Self {
            id,
            task_type: task_type.to_string(),
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
            max_execution_time_ms: default_max_execution_time_ms(),
            depends_on: Vec::new(),
            properties: Map::new(),
            context: Map::new(),
            status: Status::Created,
            status_message: None,
        }
    }
}

/// Status message consumed from the inbound queue.
///
/// Producers of this message are the task handlers; unknown fields are
/// ignored so handler-side additions never break the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub status: Status,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub context: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
}
