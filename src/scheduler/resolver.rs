use chrono::Duration;
use log::warn;

use crate::model::{DependencyMode, Task, TaskId};
use crate::scheduler::provider::TaskProvider;

/// Find a concrete upstream instance for every dependency entry of `task`.
///
/// Candidates share the task's `(namespace, workflow, job)` scope, carry the
/// declared name and were created inside the entry's look-back window ending
/// at the task's own creation time. Candidates are ranked by creation time
/// with the id tuple breaking ties, so resolution replays deterministically;
/// with identity pinned to the full tuple a job holds at most one live
/// instance per name, which makes `first`, `last` and `all` coincide until
/// the scope is ever relaxed.
///
/// Returns `None` as soon as any entry has no candidate; the caller then
/// fails the task instead of wiring a partial edge set.
pub(crate) fn resolve_dependencies(provider: &TaskProvider, task: &Task) -> Option<Vec<TaskId>> {
    let mut upstreams: Vec<TaskId> = Vec::new();

    for dep in &task.depends_on {
        let window = Duration::milliseconds(dep.lookback_window_ms);
        let earliest = task.created_at - window;

        let mut candidates: Vec<&Task> = provider
            .instances(&task.id.namespace, &dep.name)
            .filter(|upstream| {
                upstream.id.workflow == task.id.workflow && upstream.id.job == task.id.job
            })
            .filter(|upstream| upstream.id != task.id)
            .filter(|upstream| {
                upstream.created_at >= earliest && upstream.created_at <= task.created_at
            })
            .collect();
        if candidates.is_empty() {
            warn!(
                "No instance of '{}' found within the look-back window for task {}",
                dep.name, task.id
            );
            return None;
        }
        candidates.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let selected: Vec<&TaskId> = match dep.mode {
            DependencyMode::All => candidates.iter().map(|upstream| &upstream.id).collect(),
            DependencyMode::First => candidates
                .first()
                .map(|upstream| &upstream.id)
                .into_iter()
                .collect(),
            DependencyMode::Last => candidates
                .last()
                .map(|upstream| &upstream.id)
                .into_iter()
                .collect(),
        };
        for id in selected {
            if !upstreams.contains(id) {
                upstreams.push(id.clone());
            }
        }
    }

    Some(upstreams)
}
