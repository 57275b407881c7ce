//! Session event handling and the background poll loop.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::external::{ExternalError, SessionActivity, SessionEvent};
use crate::task::TaskStatus;

use super::TaskManager;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl TaskManager {
    /// Apply one session lifecycle event.
    pub async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ToolUsed { session_id, tool } => {
                self.update_progress(&session_id, &tool).await;
            }
            SessionEvent::Idle { session_id } => self.handle_idle(&session_id).await,
            SessionEvent::Deleted { session_id } => self.handle_deleted(&session_id).await,
        }
    }

    /// Feed events from `events` into [`handle_event`](Self::handle_event)
    /// until the channel closes or the manager shuts down.
    pub fn spawn_event_listener(&self, mut events: mpsc::Receiver<SessionEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => manager.handle_event(event).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Session event listener stopped");
        })
    }

    async fn handle_idle(&self, session_id: &str) {
        let min_idle = self.inner.config.min_idle_time();
        let task_id = {
            let reg = self.inner.registry.read().await;
            let Some(task) = reg.find_by_session(session_id).filter(|t| t.is_running()) else {
                return;
            };
            if task.age(Instant::now()) < min_idle {
                debug!(task_id = %task.id, "Ignoring early idle report");
                return;
            }
            task.id.clone()
        };
        self.try_complete_task(&task_id).await;
    }

    async fn handle_deleted(&self, session_id: &str) {
        let removed = {
            let mut reg = self.inner.registry.write().await;
            let Some(id) = reg.find_by_session(session_id).map(|t| t.id.clone()) else {
                return;
            };
            let Some(mut task) = reg.tasks.remove(&id) else {
                return;
            };
            let key = if task.is_running() {
                task.finish(
                    TaskStatus::Cancelled,
                    Some("Session deleted".to_string()),
                    Instant::now(),
                )
            } else {
                task.concurrency_key.take()
            };
            if let Some(key) = key {
                self.inner.gate.release(&key);
            }
            reg.remove_pending(&task.parent_session_id, &task.id);
            reg.remove_notifications_for(&task.id);
            task
        };

        self.inner
            .sessions
            .unregister_subagent_session(&removed.session_id);
        info!(
            task_id = %removed.id,
            session_id = %removed.session_id,
            "Background task removed after session deletion"
        );
    }

    /// Start the poll loop unless one is already running.
    ///
    /// The loop exits on its own once no task is running.
    pub(super) fn ensure_polling(&self) {
        if *self.inner.shutdown_tx.borrow() {
            return;
        }
        if self.inner.polling.swap(true, Ordering::AcqRel) {
            return;
        }

        let manager = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let period = self.inner.config.poll_interval().max(MIN_POLL_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            debug!(period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX), "Poll loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        manager.inner.polling.store(false, Ordering::Release);
                        break;
                    }
                }
                if manager.poll_once().await {
                    continue;
                }
                manager.inner.polling.store(false, Ordering::Release);
                // A launch may have slipped in between the check and the store.
                let restarted = manager.has_running_tasks().await
                    && !manager.inner.polling.swap(true, Ordering::AcqRel);
                if !restarted {
                    break;
                }
            }
            debug!("Poll loop stopped");
        });
    }

    async fn has_running_tasks(&self) -> bool {
        self.inner.registry.read().await.running().next().is_some()
    }

    /// One poll pass: prune, interrupt stale tasks, then complete running
    /// tasks whose session reports idle.
    ///
    /// Returns whether any task is still running.
    pub async fn poll_once(&self) -> bool {
        self.prune_stale_tasks_and_notifications().await;
        self.check_and_interrupt_stale_tasks().await;

        let now = Instant::now();
        let min_idle = self.inner.config.min_idle_time();
        let running: Vec<(String, String, Duration)> = self
            .inner
            .registry
            .read()
            .await
            .running()
            .map(|t| (t.id.clone(), t.session_id.clone(), t.age(now)))
            .collect();
        if running.is_empty() {
            return false;
        }

        let bound = self.inner.config.poll_interval().max(MIN_POLL_INTERVAL);
        for (task_id, session_id, age) in running {
            if age < min_idle {
                continue;
            }
            let status = tokio::time::timeout(bound, self.inner.sessions.status(&session_id))
                .await
                .unwrap_or(Err(ExternalError::Timeout(bound)));
            match status {
                Ok(Some(SessionActivity::Idle)) => {
                    if self.try_complete_task(&task_id).await {
                        debug!(task_id = %task_id, "Completed idle task from poll");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(session_id = %session_id, error = %e, "Session status unavailable"),
            }
        }
        true
    }
}
