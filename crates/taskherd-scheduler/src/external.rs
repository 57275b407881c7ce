//! Collaborators the scheduler drives but does not own.
//!
//! - [`ExecutionTransport`]: creates execution sessions, delivers prompts to
//!   them (both the delegated work and completion notices to parents), and
//!   aborts them.
//! - [`SessionStore`]: read access to session metadata plus the set of
//!   sessions flagged as background executions.
//! - [`NotificationSink`]: best-effort UI channel (toasts).
//! - [`SessionEvent`]: the lifecycle feed a host forwards to the manager.

use std::time::Duration;

use async_trait::async_trait;

use crate::task::ModelRef;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExternalError {
    #[error("{0}")]
    Failed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Request to create a child execution session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub parent_session_id: String,
    pub title: String,
}

/// A prompt addressed to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub session_id: String,
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
    pub text: String,
    /// Deliver without expecting the receiving session to respond.
    pub no_reply: bool,
}

/// Runs delegated work.
#[async_trait]
pub trait ExecutionTransport: Send + Sync {
    /// Create a child session under `parent_session_id`, returning its id.
    async fn create_session(&self, request: CreateSessionRequest) -> Result<String, ExternalError>;

    /// Send a prompt to a session.
    async fn prompt(&self, request: PromptRequest) -> Result<(), ExternalError>;

    /// Abort whatever the session is doing.
    async fn abort(&self, session_id: &str) -> Result<(), ExternalError>;
}

/// Model as recorded on a session message. Either half may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageModel {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

impl MessageModel {
    /// The fully specified model, or `None` if either half is missing.
    pub fn complete(&self) -> Option<ModelRef> {
        match (&self.provider_id, &self.model_id) {
            (Some(provider), Some(model)) if !provider.is_empty() && !model.is_empty() => {
                Some(ModelRef::new(provider.clone(), model.clone()))
            }
            _ => None,
        }
    }
}

/// Agent/model metadata of a session's most recent message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub agent: Option<String>,
    pub model: Option<MessageModel>,
}

/// Activity reported for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionActivity {
    Idle,
    Busy,
    Retrying,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Metadata of the session's most recent message, if any.
    async fn last_message(&self, session_id: &str)
    -> Result<Option<MessageSnapshot>, ExternalError>;

    /// Current activity of the session, `None` when unknown.
    async fn status(&self, session_id: &str) -> Result<Option<SessionActivity>, ExternalError>;

    /// Flag a session as a background execution.
    fn register_subagent_session(&self, _session_id: &str) {}

    /// Drop the background-execution flag.
    fn unregister_subagent_session(&self, _session_id: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastVariant {
    Info,
    Success,
    Warning,
}

/// A transient UI notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub title: String,
    pub message: String,
    pub variant: ToastVariant,
    pub duration: Duration,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn show(&self, toast: Toast) -> Result<(), ExternalError>;
}

/// A sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn show(&self, _toast: Toast) -> Result<(), ExternalError> {
        Ok(())
    }
}

/// Session lifecycle events forwarded by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The execution invoked a tool.
    ToolUsed { session_id: String, tool: String },
    /// The execution went idle (its turn finished).
    Idle { session_id: String },
    /// The session was deleted.
    Deleted { session_id: String },
}
