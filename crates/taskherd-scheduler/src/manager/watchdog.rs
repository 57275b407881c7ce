//! Stall detection for running tasks.
//!
//! A running task is stale when it has gone longer than the stale timeout
//! without progress AND has been running longer than the minimum runtime
//! guard. Stale tasks are cancelled, their admission slot released, their
//! execution aborted and their parent notified.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::task::{BackgroundTask, TaskStatus};

use super::TaskManager;

/// Whether `task` should be interrupted at `now`.
pub fn is_stale(
    task: &BackgroundTask,
    now: Instant,
    stale_timeout: Duration,
    min_runtime_guard: Duration,
) -> bool {
    task.is_running() && task.idle(now) > stale_timeout && task.age(now) > min_runtime_guard
}

/// Error text recorded on a task cancelled for inactivity.
pub fn stale_timeout_message(stale_timeout: Duration) -> String {
    let secs = stale_timeout.as_secs();
    if secs < 60 {
        format!("Stale timeout (no activity for {secs}s)")
    } else {
        let minutes = (secs + 30) / 60;
        format!("Stale timeout (no activity for {minutes}min)")
    }
}

impl TaskManager {
    /// Cancel every stale running task. Returns the cancelled task ids.
    pub async fn check_and_interrupt_stale_tasks(&self) -> Vec<String> {
        self.check_and_interrupt_stale_tasks_at(Instant::now()).await
    }

    /// [`check_and_interrupt_stale_tasks`](Self::check_and_interrupt_stale_tasks)
    /// evaluated at a given instant.
    pub async fn check_and_interrupt_stale_tasks_at(&self, now: Instant) -> Vec<String> {
        let stale_timeout = self.inner.config.stale_timeout();
        let min_guard = self.inner.config.min_runtime_guard();
        let message = stale_timeout_message(stale_timeout);

        let cancelled: Vec<BackgroundTask> = {
            let mut reg = self.inner.registry.write().await;
            reg.tasks
                .values_mut()
                .filter(|t| is_stale(t, now, stale_timeout, min_guard))
                .map(|task| {
                    if let Some(key) = task.finish(TaskStatus::Cancelled, Some(message.clone()), now)
                    {
                        self.inner.gate.release(&key);
                    }
                    task.clone()
                })
                .collect()
        };

        for task in &cancelled {
            warn!(
                task_id = %task.id,
                session_id = %task.session_id,
                idle_secs = task.idle(now).as_secs(),
                "Cancelled stale background task"
            );
            let manager = self.clone();
            let transport = Arc::clone(&self.inner.transport);
            let task = task.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.abort(&task.session_id).await {
                    warn!(task_id = %task.id, error = %e, "Failed to abort stale execution");
                }
                manager.notify_parent(&task).await;
            });
        }

        cancelled.into_iter().map(|t| t.id).collect()
    }
}
