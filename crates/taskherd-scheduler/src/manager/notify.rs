//! Completion notices delivered to the parent session.
//!
//! Every finished task is queued for its parent and announced with a toast.
//! The parent also receives a prompt: a short per-task notice while siblings
//! are still running, or a summary once the last pending task finishes. That
//! prompt is routed to the agent (and model) the parent is currently using,
//! and the whole send is bounded by the notification timeout so a hung
//! collaborator never holds anything up.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::external::{ExternalError, MessageSnapshot, PromptRequest, Toast, ToastVariant};
use crate::task::{BackgroundTask, ModelRef, TaskStatus, format_duration};

use super::TaskManager;

const COMPLETION_TOAST_DURATION: Duration = Duration::from_secs(5);

/// Where a notice for the parent session should be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// The parent's live agent together with its fully specified model.
    AgentWithModel { agent: String, model: ModelRef },
    /// An agent without a model override.
    AgentOnly { agent: String },
    /// Let the session decide.
    Neither,
}

impl DeliveryTarget {
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::AgentWithModel { agent, .. } | Self::AgentOnly { agent } => Some(agent),
            Self::Neither => None,
        }
    }

    pub const fn model(&self) -> Option<&ModelRef> {
        match self {
            Self::AgentWithModel { model, .. } => Some(model),
            _ => None,
        }
    }
}

/// Pick the delivery target from the parent's most recent message.
///
/// A model is only attached when the live message carries both an agent and
/// a complete provider/model pair; a partial model is never sent. Without a
/// live agent the recorded `fallback_agent` is used.
pub fn resolve_delivery_target(
    snapshot: Option<&MessageSnapshot>,
    fallback_agent: Option<&str>,
) -> DeliveryTarget {
    let live_agent = snapshot
        .and_then(|s| s.agent.as_deref())
        .filter(|a| !a.is_empty());
    let live_model = snapshot
        .and_then(|s| s.model.as_ref())
        .and_then(crate::external::MessageModel::complete);

    match (live_agent, live_model) {
        (Some(agent), Some(model)) => DeliveryTarget::AgentWithModel {
            agent: agent.to_string(),
            model,
        },
        (Some(agent), None) => DeliveryTarget::AgentOnly {
            agent: agent.to_string(),
        },
        (None, _) => fallback_agent
            .filter(|a| !a.is_empty())
            .map_or(DeliveryTarget::Neither, |agent| DeliveryTarget::AgentOnly {
                agent: agent.to_string(),
            }),
    }
}

fn status_word(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Running => "RUNNING",
        TaskStatus::Completed => "COMPLETED",
        TaskStatus::Cancelled => "CANCELLED",
    }
}

/// Notice for one finished task while siblings are still running.
pub(crate) fn render_task_notice(task: &BackgroundTask, remaining: usize, now: Instant) -> String {
    let mut text = format!(
        "[BACKGROUND TASK {}] {} \"{}\" finished in {}.",
        status_word(task.status),
        task.id,
        task.description,
        format_duration(task.duration(now)),
    );
    if let Some(error) = &task.error {
        let _ = write!(text, "\nError: {error}");
    }
    let _ = write!(
        text,
        "\n{remaining} background task(s) still running. You will be notified when all complete."
    );
    text
}

/// Summary sent when the last pending task of a parent finishes.
pub(crate) fn render_all_complete(finished: &[BackgroundTask], now: Instant) -> String {
    let mut text = String::from("[ALL BACKGROUND TASKS COMPLETE]\n");
    for task in finished {
        let _ = write!(
            text,
            "\n- {} \"{}\": {} ({})",
            task.id,
            task.description,
            task.status,
            format_duration(task.duration(now)),
        );
        if let Some(error) = &task.error {
            let _ = write!(text, " error: {error}");
        }
    }
    text.push_str("\n\nRetrieve results from the task sessions when needed.");
    text
}

impl TaskManager {
    /// Queue the finished task for its parent and deliver the notice.
    ///
    /// Never fails: delivery problems are logged. The admission slot must
    /// already be released before calling this.
    pub(crate) async fn notify_parent(&self, task: &BackgroundTask) {
        if task.parent_session_id.is_empty() {
            debug!(task_id = %task.id, "Task has no parent session, skipping notice");
            return;
        }

        let (remaining, finished) = {
            let mut reg = self.inner.registry.write().await;
            reg.queue_notification(task.clone());
            let remaining = reg.remove_pending(&task.parent_session_id, &task.id);
            let finished: Vec<BackgroundTask> = if remaining == 0 {
                reg.notifications
                    .get(&task.parent_session_id)
                    .map(|q| q.iter().cloned().collect())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            (remaining, finished)
        };

        let (title, variant) = match (task.status, task.error.is_some()) {
            (TaskStatus::Cancelled, _) | (_, true) => {
                ("Background task stopped", ToastVariant::Warning)
            }
            _ => ("Background task completed", ToastVariant::Success),
        };
        self.spawn_toast(Toast {
            title: title.to_string(),
            message: task.description.clone(),
            variant,
            duration: COMPLETION_TOAST_DURATION,
        });

        let now = Instant::now();
        let (text, no_reply) = if remaining == 0 {
            (render_all_complete(&finished, now), false)
        } else {
            (render_task_notice(task, remaining, now), true)
        };

        let timeout = self.inner.config.notification_timeout();
        let sent = tokio::time::timeout(timeout, self.deliver_to_parent(task, text, no_reply))
            .await
            .unwrap_or(Err(ExternalError::Timeout(timeout)));
        match sent {
            Ok(()) => debug!(task_id = %task.id, remaining, "Parent notified"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to notify parent session"),
        }
    }

    async fn deliver_to_parent(
        &self,
        task: &BackgroundTask,
        text: String,
        no_reply: bool,
    ) -> Result<(), ExternalError> {
        let snapshot = match self
            .inner
            .sessions
            .last_message(&task.parent_session_id)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(error = %e, "Could not read parent session, using recorded agent");
                None
            }
        };
        let target = resolve_delivery_target(snapshot.as_ref(), task.parent_agent.as_deref());

        self.inner
            .transport
            .prompt(PromptRequest {
                session_id: task.parent_session_id.clone(),
                agent: target.agent().map(str::to_string),
                model: target.model().cloned(),
                text,
                no_reply,
            })
            .await
    }
}
