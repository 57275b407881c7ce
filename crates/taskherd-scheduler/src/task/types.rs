//! Background task types.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully specified model reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            variant: None,
        }
    }

    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Concurrency key for tasks running on this model: `provider/model`.
    pub fn concurrency_key(&self) -> String {
        format!("{}/{}", self.provider_id, self.model_id)
    }
}

/// Activity snapshot maintained from the execution's event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub tool_calls: u32,
    pub last_tool: Option<String>,
    pub last_update: Instant,
}

impl TaskProgress {
    pub const fn new(now: Instant) -> Self {
        Self {
            tool_calls: 0,
            last_tool: None,
            last_update: now,
        }
    }

    /// Refresh the activity timestamp. Never moves it backwards.
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_update {
            self.last_update = now;
        }
    }

    pub fn record_tool(&mut self, tool: &str, now: Instant) {
        self.tool_calls = self.tool_calls.saturating_add(1);
        self.last_tool = Some(tool.to_string());
        self.touch(now);
    }
}

/// One delegated unit of background work.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub id: String,
    /// Execution session doing the work.
    pub session_id: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub status: TaskStatus,
    pub started_at: Instant,
    pub completed_at: Option<Instant>,
    pub error: Option<String>,
    /// Admission key currently held.
    pub concurrency_key: Option<String>,
    /// Admission key this task runs under, kept across terminal transitions.
    pub concurrency_group: Option<String>,
    pub progress: TaskProgress,
    pub parent_agent: Option<String>,
    pub parent_model: Option<ModelRef>,
}

impl BackgroundTask {
    pub const fn is_running(&self) -> bool {
        matches!(self.status, TaskStatus::Running)
    }

    /// Time since the task started.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Time since the last progress update.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.progress.last_update)
    }

    /// Wall time from start to completion, or to `now` while running.
    pub fn duration(&self, now: Instant) -> Duration {
        self.completed_at
            .unwrap_or(now)
            .saturating_duration_since(self.started_at)
    }

    /// Move to a terminal state and hand back the held admission key.
    ///
    /// The caller must release the returned key before doing anything that
    /// can block.
    pub(crate) fn finish(
        &mut self,
        status: TaskStatus,
        error: Option<String>,
        now: Instant,
    ) -> Option<String> {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(now);
        if error.is_some() {
            self.error = error;
        }
        self.concurrency_key.take()
    }
}

/// Input for launching a new background task.
#[derive(Debug, Clone, Default)]
pub struct LaunchInput {
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    /// Model the execution should run on.
    pub model: Option<ModelRef>,
    /// Explicit admission key; defaults to the model key, then the agent.
    pub concurrency_key: Option<String>,
    pub parent_agent: Option<String>,
    pub parent_model: Option<ModelRef>,
}

impl LaunchInput {
    /// Admission key for this launch.
    pub fn resolve_concurrency_key(&self) -> String {
        self.concurrency_key.clone().unwrap_or_else(|| {
            self.model
                .as_ref()
                .map_or_else(|| self.agent.clone(), ModelRef::concurrency_key)
        })
    }
}

/// Input for registering an execution started outside the manager.
#[derive(Debug, Clone, Default)]
pub struct TrackInput {
    /// Id assigned by whoever started the execution.
    pub task_id: String,
    pub session_id: String,
    pub parent_session_id: String,
    pub description: String,
    pub agent: Option<String>,
    pub parent_agent: Option<String>,
    /// Admission key to hold while the execution runs, if any.
    pub concurrency_key: Option<String>,
}

/// Input for resuming a finished task with a new prompt.
#[derive(Debug, Clone, Default)]
pub struct ResumeInput {
    pub session_id: String,
    pub prompt: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_model: Option<ModelRef>,
    pub parent_agent: Option<String>,
}

/// Generate a fresh task id: `bg_` followed by 8 hex characters.
pub fn new_task_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("bg_{}", &uuid[..8])
}

/// Render a duration as `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
