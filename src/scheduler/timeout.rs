use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::model::TaskId;

/// Per-task execution deadlines.
///
/// Each armed deadline is a deferred job on the runtime that drives `on_fire`
/// once the wall clock passes it; a deadline already in the past dispatches
/// immediately. Arming an already-armed task is ignored so the first deadline
/// stays authoritative, and cancellation is best-effort: a firing that has
/// already started delivers its status update, which the scheduler absorbs as
/// a terminal-state no-op.
pub(crate) struct TimeoutManager {
    timers: HashMap<TaskId, JoinHandle<()>>,
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
        }
    }

    pub fn arm<F>(&mut self, id: &TaskId, deadline: DateTime<Utc>, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.timers.contains_key(id) {
            debug!("Timeout already armed for task {id}");
            return;
        }

        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            on_fire.await;
        });
        self.timers.insert(id.clone(), handle);
    }

    /// No-op when the timer never existed or already fired.
    pub fn cancel(&mut self, id: &TaskId) {
        if let Some(handle) = self.timers.remove(id) {
            handle.abort();
            debug!("Cancelled timeout for task {id}");
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    pub fn armed(&self, id: &TaskId) -> bool {
        self.timers.contains_key(id)
    }
}
