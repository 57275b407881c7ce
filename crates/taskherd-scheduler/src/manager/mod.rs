//! Background task lifecycle management.
//!
//! [`TaskManager`] is the registry and state machine for delegated work:
//! - admits launches through the [`ConcurrencyGate`](crate::admission::ConcurrencyGate)
//! - tracks progress from the session event feed
//! - completes, cancels and resumes tasks, always releasing the admission
//!   slot before any collaborator call
//! - cancels stalled tasks ([`watchdog`]) and prunes old records ([`prune`])
//! - notifies the parent session when its tasks finish ([`notify`])

mod events;
pub mod notify;
pub mod prune;
mod registry;
mod tasks;
pub mod watchdog;

pub use notify::{DeliveryTarget, resolve_delivery_target};
pub use prune::PruneReport;
pub use tasks::{TaskManager, TaskManagerBuilder};

/// Errors surfaced to callers of the task manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Task not found for session: {session_id}")]
    TaskNotFound { session_id: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Failed to create background session: {reason}")]
    SessionCreateFailed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_session() {
        let err = ManagerError::TaskNotFound {
            session_id: "ses_missing".to_string(),
        };
        assert!(err.to_string().contains("ses_missing"));
    }
}
