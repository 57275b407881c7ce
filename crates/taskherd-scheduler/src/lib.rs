//! taskherd Scheduler Library
//!
//! Concurrency-limited lifecycle management for delegated background work:
//! - Keyed admission gate with FIFO handoff per key
//! - Task registry: launch, track, complete, resume and hierarchy queries
//! - Stall watchdog and retention pruning
//! - Parent-session completion notices
//! - Reference-counted process signal cleanup

pub mod admission;
pub mod external;
pub mod lifecycle;
pub mod manager;
pub mod task;

pub use admission::{AdmissionPermit, ConcurrencyGate};
pub use lifecycle::{LifecycleGuard, ShutdownHook};
pub use manager::{ManagerError, TaskManager, TaskManagerBuilder};
pub use task::{BackgroundTask, LaunchInput, ModelRef, ResumeInput, TaskStatus, TrackInput};
