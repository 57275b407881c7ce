//! In-memory task bookkeeping owned by one [`TaskManager`](super::TaskManager).
//!
//! Everything here is synchronous and runs under the manager's registry lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use crate::task::BackgroundTask;

#[derive(Default)]
pub(crate) struct Registry {
    /// Tasks keyed by task id.
    pub tasks: HashMap<String, BackgroundTask>,
    /// Finished-task notices awaiting pickup, FIFO per parent session.
    pub notifications: HashMap<String, VecDeque<BackgroundTask>>,
    /// Running task ids per parent session, used for the all-complete notice.
    pub pending_by_parent: HashMap<String, HashSet<String>>,
}

impl Registry {
    pub fn find_by_session(&self, session_id: &str) -> Option<&BackgroundTask> {
        self.tasks.values().find(|t| t.session_id == session_id)
    }

    pub fn running(&self) -> impl Iterator<Item = &BackgroundTask> {
        self.tasks.values().filter(|t| t.is_running())
    }

    pub fn add_pending(&mut self, parent_session_id: &str, task_id: &str) {
        if parent_session_id.is_empty() {
            return;
        }
        self.pending_by_parent
            .entry(parent_session_id.to_string())
            .or_default()
            .insert(task_id.to_string());
    }

    /// Drop `task_id` from its parent's pending set. Returns how many tasks
    /// are still pending for that parent.
    pub fn remove_pending(&mut self, parent_session_id: &str, task_id: &str) -> usize {
        let Some(pending) = self.pending_by_parent.get_mut(parent_session_id) else {
            return 0;
        };
        pending.remove(task_id);
        let remaining = pending.len();
        if remaining == 0 {
            self.pending_by_parent.remove(parent_session_id);
        }
        remaining
    }

    pub fn queue_notification(&mut self, task: BackgroundTask) {
        let queue = self
            .notifications
            .entry(task.parent_session_id.clone())
            .or_default();
        queue.retain(|queued| queued.id != task.id);
        queue.push_back(task);
    }

    /// Remove every queued notice for `task_id`, dropping queues that become
    /// empty. Returns how many notices were removed.
    pub fn remove_notifications_for(&mut self, task_id: &str) -> usize {
        let mut removed = 0;
        self.notifications.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|n| n.id != task_id);
            removed += before - queue.len();
            !queue.is_empty()
        });
        removed
    }

    /// Direct children of `session_id`.
    pub fn children_of(&self, session_id: &str) -> Vec<BackgroundTask> {
        let mut children: Vec<BackgroundTask> = self
            .tasks
            .values()
            .filter(|t| t.parent_session_id == session_id && t.session_id != session_id)
            .cloned()
            .collect();
        sort_by_start(&mut children);
        children
    }

    /// Transitive closure of children along the parent-session edge.
    pub fn descendants_of(&self, session_id: &str) -> Vec<BackgroundTask> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        self.collect_descendants(session_id, &mut visited, &mut out);
        sort_by_start(&mut out);
        out
    }

    fn collect_descendants(
        &self,
        session_id: &str,
        visited: &mut HashSet<String>,
        out: &mut Vec<BackgroundTask>,
    ) {
        if !visited.insert(session_id.to_string()) {
            return;
        }
        for child in self.children_of(session_id) {
            let child_session = child.session_id.clone();
            out.push(child);
            self.collect_descendants(&child_session, visited, out);
        }
    }

    /// Ids of tasks older than `cutoff` age at `now`.
    pub fn older_than(&self, now: Instant, cutoff: std::time::Duration) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.age(now) > cutoff)
            .map(|t| t.id.clone())
            .collect()
    }
}

fn sort_by_start(tasks: &mut [BackgroundTask]) {
    tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
}
