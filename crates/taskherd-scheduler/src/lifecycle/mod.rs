//! Process-level cleanup shared by every scheduler instance.
//!
//! - [`LifecycleGuard`]: reference-counted installation of the signal
//!   listener that runs each live instance's [`ShutdownHook`].

pub mod guard;

pub use guard::{InstanceId, LifecycleGuard, ShutdownHook};
