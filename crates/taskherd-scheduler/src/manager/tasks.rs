//! Task registry and state machine.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use taskherd_core::SchedulerConfig;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::admission::ConcurrencyGate;
use crate::external::{
    CreateSessionRequest, ExecutionTransport, ExternalError, NotificationSink, NullSink,
    PromptRequest, SessionStore, Toast, ToastVariant,
};
use crate::lifecycle::{InstanceId, LifecycleGuard, ShutdownHook};
use crate::task::{
    BackgroundTask, LaunchInput, ResumeInput, TaskProgress, TaskStatus, TrackInput, new_task_id,
};

use super::ManagerError;
use super::registry::Registry;

/// Agent recorded for tracked executions that did not name one.
const DEFAULT_TRACKED_AGENT: &str = "delegate_task";

const STARTED_TOAST_DURATION: Duration = Duration::from_secs(3);

pub(super) struct ManagerInner {
    pub(super) config: SchedulerConfig,
    pub(super) gate: Arc<ConcurrencyGate>,
    pub(super) transport: Arc<dyn ExecutionTransport>,
    pub(super) sessions: Arc<dyn SessionStore>,
    pub(super) sink: Arc<dyn NotificationSink>,
    pub(super) registry: RwLock<Registry>,
    /// Set while a poll loop is alive.
    pub(super) polling: AtomicBool,
    pub(super) shutdown_tx: watch::Sender<bool>,
    instance: Mutex<Option<InstanceId>>,
    guard: Arc<LifecycleGuard>,
}

/// Registry and lifecycle manager for background tasks.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct TaskManager {
    pub(super) inner: Arc<ManagerInner>,
}

/// Builder for [`TaskManager`].
pub struct TaskManagerBuilder {
    config: SchedulerConfig,
    transport: Arc<dyn ExecutionTransport>,
    sessions: Arc<dyn SessionStore>,
    sink: Arc<dyn NotificationSink>,
    gate: Option<Arc<ConcurrencyGate>>,
    guard: Option<Arc<LifecycleGuard>>,
}

impl TaskManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Share an admission gate instead of building one from the config.
    #[must_use]
    pub fn gate(mut self, gate: Arc<ConcurrencyGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Register with this guard instead of [`LifecycleGuard::global`].
    #[must_use]
    pub fn lifecycle_guard(mut self, guard: Arc<LifecycleGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn build(self) -> TaskManager {
        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(ConcurrencyGate::new(self.config.clone())));
        let guard = self.guard.unwrap_or_else(LifecycleGuard::global);
        let exit_on_signal = self.config.exit_on_signal;
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(ManagerInner {
            config: self.config,
            gate,
            transport: self.transport,
            sessions: self.sessions,
            sink: self.sink,
            registry: RwLock::new(Registry::default()),
            polling: AtomicBool::new(false),
            shutdown_tx,
            instance: Mutex::new(None),
            guard: Arc::clone(&guard),
        });

        let hook: Arc<dyn ShutdownHook> = inner.clone();
        let (id, instances) = guard.acquire(Arc::downgrade(&hook), exit_on_signal);
        *lock(&inner.instance) = Some(id);
        info!(instances, "TaskManager created");

        TaskManager { inner }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskManager {
    /// Create a manager with the given config, no toast sink, registered
    /// with the process-wide lifecycle guard.
    pub fn new(
        config: SchedulerConfig,
        transport: Arc<dyn ExecutionTransport>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self::builder(transport, sessions).config(config).build()
    }

    pub fn builder(
        transport: Arc<dyn ExecutionTransport>,
        sessions: Arc<dyn SessionStore>,
    ) -> TaskManagerBuilder {
        TaskManagerBuilder {
            config: SchedulerConfig::default(),
            transport,
            sessions,
            sink: Arc::new(NullSink),
            gate: None,
            guard: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.inner.gate
    }

    /// Launch a new background task.
    ///
    /// Waits for an admission slot, creates the execution session, registers
    /// the task and dispatches the prompt without waiting for the execution.
    pub async fn launch(&self, input: LaunchInput) -> Result<BackgroundTask, ManagerError> {
        if input.agent.trim().is_empty() {
            return Err(ManagerError::Validation {
                message: "agent is required".to_string(),
            });
        }

        let key = input.resolve_concurrency_key();
        // Held until the task record owns the key; dropping this future
        // before then gives the slot back.
        let permit = self.inner.gate.acquire(&key).await;

        let session_id = match self
            .inner
            .transport
            .create_session(CreateSessionRequest {
                parent_session_id: input.parent_session_id.clone(),
                title: format!("Background: {}", input.description),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(concurrency_key = %key, error = %e, "Failed to create background session");
                return Err(ManagerError::SessionCreateFailed {
                    reason: e.to_string(),
                });
            }
        };
        self.inner.sessions.register_subagent_session(&session_id);

        let now = Instant::now();
        let task = BackgroundTask {
            id: new_task_id(),
            session_id,
            parent_session_id: input.parent_session_id,
            parent_message_id: input.parent_message_id,
            description: input.description,
            prompt: input.prompt,
            agent: input.agent,
            model: input.model,
            status: TaskStatus::Running,
            started_at: now,
            completed_at: None,
            error: None,
            concurrency_key: Some(key.clone()),
            concurrency_group: Some(key),
            progress: TaskProgress::new(now),
            parent_agent: input.parent_agent,
            parent_model: input.parent_model,
        };

        {
            let mut reg = self.inner.registry.write().await;
            reg.add_pending(&task.parent_session_id, &task.id);
            reg.tasks.insert(task.id.clone(), task.clone());
            permit.forget();
        }

        info!(
            task_id = %task.id,
            session_id = %task.session_id,
            agent = %task.agent,
            concurrency_key = ?task.concurrency_key,
            "Background task launched"
        );

        self.spawn_toast(Toast {
            title: "Background task started".to_string(),
            message: format!("{} ({})", task.description, task.agent),
            variant: ToastVariant::Info,
            duration: STARTED_TOAST_DURATION,
        });
        self.ensure_polling();
        self.dispatch_prompt(
            task.id.clone(),
            PromptRequest {
                session_id: task.session_id.clone(),
                agent: Some(task.agent.clone()),
                model: task.model.clone(),
                text: task.prompt.clone(),
                no_reply: false,
            },
        );

        Ok(task)
    }

    /// Register an execution that was started outside this manager.
    ///
    /// Idempotent per task id and per execution session: an already-known
    /// task is returned without acquiring another slot. A changed parent
    /// session re-links the existing task.
    pub async fn track_task(&self, input: TrackInput) -> BackgroundTask {
        if let Some(existing) = self.relink_tracked(&input).await {
            return existing;
        }

        let permit = match &input.concurrency_key {
            Some(key) => Some(self.inner.gate.acquire(key).await),
            None => None,
        };

        let now = Instant::now();
        let task = {
            let mut reg = self.inner.registry.write().await;
            let existing = reg
                .tasks
                .get(&input.task_id)
                .or_else(|| reg.find_by_session(&input.session_id))
                .cloned();
            if let Some(existing) = existing {
                // Registered by a concurrent call while we waited for a slot.
                return existing;
            }

            let task = BackgroundTask {
                id: input.task_id,
                session_id: input.session_id,
                parent_session_id: input.parent_session_id,
                parent_message_id: String::new(),
                description: input.description,
                prompt: String::new(),
                agent: input
                    .agent
                    .filter(|a| !a.is_empty())
                    .unwrap_or_else(|| DEFAULT_TRACKED_AGENT.to_string()),
                model: None,
                status: TaskStatus::Running,
                started_at: now,
                completed_at: None,
                error: None,
                concurrency_key: input.concurrency_key.clone(),
                concurrency_group: input.concurrency_key,
                progress: TaskProgress::new(now),
                parent_agent: input.parent_agent,
                parent_model: None,
            };
            reg.add_pending(&task.parent_session_id, &task.id);
            reg.tasks.insert(task.id.clone(), task.clone());
            if let Some(permit) = permit {
                permit.forget();
            }
            task
        };

        self.inner
            .sessions
            .register_subagent_session(&task.session_id);
        info!(
            task_id = %task.id,
            session_id = %task.session_id,
            concurrency_key = ?task.concurrency_key,
            "External task tracked"
        );
        self.spawn_toast(Toast {
            title: "Background task started".to_string(),
            message: task.description.clone(),
            variant: ToastVariant::Info,
            duration: STARTED_TOAST_DURATION,
        });
        self.ensure_polling();
        task
    }

    async fn relink_tracked(&self, input: &TrackInput) -> Option<BackgroundTask> {
        let task = {
            let mut reg = self.inner.registry.write().await;
            let id = reg
                .tasks
                .get(&input.task_id)
                .or_else(|| reg.find_by_session(&input.session_id))
                .map(|t| t.id.clone())?;

            let (old_parent, running) = {
                let task = reg.tasks.get_mut(&id)?;
                let old_parent = task.parent_session_id.clone();
                if old_parent != input.parent_session_id {
                    task.parent_session_id.clone_from(&input.parent_session_id);
                }
                if input.parent_agent.is_some() {
                    task.parent_agent.clone_from(&input.parent_agent);
                }
                if task.concurrency_group.is_none() {
                    task.concurrency_group.clone_from(&input.concurrency_key);
                }
                (old_parent, task.is_running())
            };

            if old_parent != input.parent_session_id {
                reg.remove_pending(&old_parent, &id);
            }
            if running {
                reg.add_pending(&input.parent_session_id, &id);
            }
            reg.tasks.get(&id).cloned()?
        };

        debug!(task_id = %task.id, "Task already tracked");
        self.inner
            .sessions
            .register_subagent_session(&task.session_id);
        if task.is_running() {
            self.ensure_polling();
        }
        Some(task)
    }

    /// Complete a running task exactly once.
    ///
    /// Releases the admission slot before notifying the parent. Returns
    /// `false` (and does nothing) if the task is unknown or already terminal.
    pub async fn try_complete_task(&self, task_id: &str) -> bool {
        let Some(task) = self.finish_task(task_id, TaskStatus::Completed, None).await else {
            debug!(task_id, "Task already finished, skipping completion");
            return false;
        };
        info!(
            task_id = %task.id,
            duration_ms = u64::try_from(task.duration(Instant::now()).as_millis()).unwrap_or(u64::MAX),
            "Background task completed"
        );
        self.notify_parent(&task).await;
        true
    }

    /// Transition a running task to a terminal state and release its slot,
    /// all under the registry lock. Returns the finished snapshot, or `None`
    /// if the task was not running.
    pub(super) async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Option<BackgroundTask> {
        let mut reg = self.inner.registry.write().await;
        let task = reg.tasks.get_mut(task_id)?;
        if !task.is_running() {
            return None;
        }
        if let Some(key) = task.finish(status, error, Instant::now()) {
            self.inner.gate.release(&key);
        }
        Some(task.clone())
    }

    /// Resume a finished task with a new prompt under its original identity.
    pub async fn resume(&self, input: ResumeInput) -> Result<BackgroundTask, ManagerError> {
        let not_found = || ManagerError::TaskNotFound {
            session_id: input.session_id.clone(),
        };

        let (task_id, group) = {
            let reg = self.inner.registry.read().await;
            let task = reg.find_by_session(&input.session_id).ok_or_else(not_found)?;
            if task.is_running() {
                debug!(task_id = %task.id, "Resume ignored, task already running");
                return Ok(task.clone());
            }
            (task.id.clone(), task.concurrency_group.clone())
        };

        let permit = match &group {
            Some(key) => Some(self.inner.gate.acquire(key).await),
            None => None,
        };

        let resumed = {
            let mut reg = self.inner.registry.write().await;
            let Some(task) = reg.tasks.get_mut(&task_id) else {
                return Err(not_found());
            };
            if task.is_running() {
                // Resumed by a concurrent call while we waited for a slot.
                return Ok(task.clone());
            }

            task.status = TaskStatus::Running;
            task.completed_at = None;
            task.error = None;
            task.concurrency_key.clone_from(&group);
            task.parent_session_id.clone_from(&input.parent_session_id);
            task.parent_message_id.clone_from(&input.parent_message_id);
            task.parent_model.clone_from(&input.parent_model);
            if input.parent_agent.is_some() {
                task.parent_agent.clone_from(&input.parent_agent);
            }
            task.progress.touch(Instant::now());

            let snapshot = task.clone();
            // The previous run's notice is obsolete once the task runs again.
            reg.remove_notifications_for(&snapshot.id);
            reg.add_pending(&snapshot.parent_session_id, &snapshot.id);
            if let Some(permit) = permit {
                permit.forget();
            }
            snapshot
        };

        self.inner
            .sessions
            .register_subagent_session(&resumed.session_id);
        info!(
            task_id = %resumed.id,
            session_id = %resumed.session_id,
            tool_calls = resumed.progress.tool_calls,
            "Background task resumed"
        );
        self.spawn_toast(Toast {
            title: "Resuming background task".to_string(),
            message: resumed.description.clone(),
            variant: ToastVariant::Info,
            duration: STARTED_TOAST_DURATION,
        });
        self.ensure_polling();
        self.dispatch_prompt(
            resumed.id.clone(),
            PromptRequest {
                session_id: resumed.session_id.clone(),
                agent: Some(resumed.agent.clone()),
                model: resumed.model.clone(),
                text: input.prompt,
                no_reply: false,
            },
        );

        Ok(resumed)
    }

    /// Deliver a prompt to an execution in the background. A failed
    /// dispatch finishes the task with the failure recorded.
    fn dispatch_prompt(&self, task_id: String, request: PromptRequest) {
        let manager = self.clone();
        let agent = request.agent.clone().unwrap_or_default();
        tokio::spawn(async move {
            let Err(e) = manager.inner.transport.prompt(request).await else {
                return;
            };
            let message = dispatch_error_message(&agent, &e);
            warn!(task_id = %task_id, error = %e, "Prompt dispatch failed");
            if let Some(task) = manager
                .finish_task(&task_id, TaskStatus::Completed, Some(message))
                .await
            {
                manager.notify_parent(&task).await;
            }
        });
    }

    pub(super) fn spawn_toast(&self, toast: Toast) {
        let sink = Arc::clone(&self.inner.sink);
        let timeout = self.inner.config.notification_timeout();
        tokio::spawn(async move {
            let shown = tokio::time::timeout(timeout, sink.show(toast))
                .await
                .unwrap_or(Err(ExternalError::Timeout(timeout)));
            if let Err(e) = shown {
                debug!(error = %e, "Toast delivery failed");
            }
        });
    }

    /// Record a tool invocation for the task running in `session_id`.
    pub async fn update_progress(&self, session_id: &str, tool: &str) -> bool {
        self.update_progress_at(session_id, tool, Instant::now()).await
    }

    /// [`update_progress`](Self::update_progress) recorded at a given instant.
    pub async fn update_progress_at(&self, session_id: &str, tool: &str, now: Instant) -> bool {
        let mut reg = self.inner.registry.write().await;
        let Some(task) = reg
            .tasks
            .values_mut()
            .find(|t| t.session_id == session_id && t.is_running())
        else {
            return false;
        };
        task.progress.record_tool(tool, now);
        true
    }

    pub async fn get_task(&self, task_id: &str) -> Option<BackgroundTask> {
        self.inner.registry.read().await.tasks.get(task_id).cloned()
    }

    pub async fn find_by_session(&self, session_id: &str) -> Option<BackgroundTask> {
        self.inner
            .registry
            .read()
            .await
            .find_by_session(session_id)
            .cloned()
    }

    pub async fn get_running_tasks(&self) -> Vec<BackgroundTask> {
        self.inner
            .registry
            .read()
            .await
            .running()
            .cloned()
            .collect()
    }

    /// Tasks in a terminal state.
    pub async fn get_completed_tasks(&self) -> Vec<BackgroundTask> {
        self.inner
            .registry
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Direct children of `session_id`.
    pub async fn get_tasks_by_parent_session(&self, session_id: &str) -> Vec<BackgroundTask> {
        self.inner.registry.read().await.children_of(session_id)
    }

    /// Every task transitively spawned from `session_id`.
    pub async fn get_all_descendant_tasks(&self, session_id: &str) -> Vec<BackgroundTask> {
        self.inner.registry.read().await.descendants_of(session_id)
    }

    /// Finished-task notices queued for `session_id`, oldest first.
    pub async fn pending_notifications(&self, session_id: &str) -> Vec<BackgroundTask> {
        self.inner
            .registry
            .read()
            .await
            .notifications
            .get(session_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the notices queued for `session_id`. Returns how many were dropped.
    pub async fn clear_notifications(&self, session_id: &str) -> usize {
        self.inner
            .registry
            .write()
            .await
            .notifications
            .remove(session_id)
            .map_or(0, |q| q.len())
    }

    /// Stop background work, clear the registry and leave the lifecycle
    /// guard. Safe to call more than once.
    pub async fn shutdown(&self) {
        let instance = lock(&self.inner.instance).take();
        let Some(id) = instance else {
            debug!("TaskManager already shut down");
            return;
        };
        let aborted = self.inner.teardown().await;
        let remaining = self.inner.guard.release(id);
        info!(aborted, remaining_instances = remaining, "TaskManager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.instance).is_none()
    }
}

impl ManagerInner {
    /// Release every held slot, clear all maps and abort running executions.
    /// Returns how many running executions were aborted.
    async fn teardown(&self) -> usize {
        self.shutdown_tx.send_replace(true);

        let (running, sessions) = {
            let mut reg = self.registry.write().await;
            let mut running = Vec::new();
            let mut sessions = Vec::new();
            for task in reg.tasks.values_mut() {
                if let Some(key) = task.concurrency_key.take() {
                    self.gate.release(&key);
                }
                if task.is_running() {
                    running.push(task.session_id.clone());
                }
                sessions.push(task.session_id.clone());
            }
            reg.tasks.clear();
            reg.notifications.clear();
            reg.pending_by_parent.clear();
            (running, sessions)
        };

        for session_id in &sessions {
            self.sessions.unregister_subagent_session(session_id);
        }

        let mut aborts = JoinSet::new();
        for session_id in running.iter().cloned() {
            let transport = Arc::clone(&self.transport);
            aborts.spawn(async move {
                if let Err(e) = transport.abort(&session_id).await {
                    warn!(session_id = %session_id, error = %e, "Abort during shutdown failed");
                }
            });
        }
        let drain = async { while aborts.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.notification_timeout(), drain)
            .await
            .is_err()
        {
            warn!("Timed out aborting running executions during shutdown");
        }
        running.len()
    }
}

impl Drop for ManagerInner {
    /// A manager dropped without `shutdown` still leaves the lifecycle guard.
    fn drop(&mut self) {
        let instance = self
            .instance
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = instance {
            let remaining = self.guard.release(id);
            debug!(remaining_instances = remaining, "TaskManager dropped without shutdown");
        }
    }
}

#[async_trait]
impl ShutdownHook for ManagerInner {
    async fn on_process_exit(&self) {
        let aborted = self.teardown().await;
        info!(aborted, "Background tasks cleaned up on process exit");
    }
}

fn dispatch_error_message(agent: &str, err: &ExternalError) -> String {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("agent not found") || lower.contains("unknown agent") {
        format!("Agent \"{agent}\" not found. Make sure the agent is registered.")
    } else {
        format!("Failed to start execution: {text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_agent_error_is_rewritten() {
        let err = ExternalError::Failed("Unknown agent: oracle".to_string());
        assert_eq!(
            dispatch_error_message("oracle", &err),
            "Agent \"oracle\" not found. Make sure the agent is registered."
        );
    }

    #[test]
    fn other_dispatch_errors_keep_cause() {
        let err = ExternalError::Failed("connection reset".to_string());
        assert_eq!(
            dispatch_error_message("oracle", &err),
            "Failed to start execution: connection reset"
        );
    }
}
