//! Retention pruning of task records and queued notices.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info};

use super::TaskManager;

/// What one pruning pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub tasks: usize,
    pub notifications: usize,
}

impl PruneReport {
    pub const fn is_empty(&self) -> bool {
        self.tasks == 0 && self.notifications == 0
    }
}

impl TaskManager {
    /// Drop task records and notices older than the retention window.
    pub async fn prune_stale_tasks_and_notifications(&self) -> PruneReport {
        self.prune_stale_tasks_and_notifications_at(Instant::now())
            .await
    }

    /// [`prune_stale_tasks_and_notifications`](Self::prune_stale_tasks_and_notifications)
    /// evaluated at a given instant.
    ///
    /// Records are removed by age regardless of status. A removed record that
    /// still holds an admission slot gives it back.
    pub async fn prune_stale_tasks_and_notifications_at(&self, now: Instant) -> PruneReport {
        let retention = self.inner.config.retention();

        let (report, sessions) = {
            let mut reg = self.inner.registry.write().await;
            let expired = reg.older_than(now, retention);
            let mut sessions = Vec::with_capacity(expired.len());
            for id in &expired {
                let Some(mut task) = reg.tasks.remove(id) else {
                    continue;
                };
                if let Some(key) = task.concurrency_key.take() {
                    self.inner.gate.release(&key);
                }
                reg.remove_pending(&task.parent_session_id, &task.id);
                debug!(task_id = %task.id, status = %task.status, "Pruned expired task");
                sessions.push(task.session_id);
            }

            let removed: HashSet<&String> = expired.iter().collect();
            let mut notifications = 0;
            reg.notifications.retain(|_, queue| {
                let before = queue.len();
                queue.retain(|n| !removed.contains(&n.id) && n.age(now) <= retention);
                notifications += before - queue.len();
                !queue.is_empty()
            });

            (
                PruneReport {
                    tasks: expired.len(),
                    notifications,
                },
                sessions,
            )
        };

        for session_id in &sessions {
            self.inner.sessions.unregister_subagent_session(session_id);
        }
        if !report.is_empty() {
            info!(
                tasks = report.tasks,
                notifications = report.notifications,
                "Pruned expired background task records"
            );
        }
        report
    }
}
