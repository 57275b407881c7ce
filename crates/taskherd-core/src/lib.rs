//! `taskherd` Core Library
//!
//! Shared functionality for hosts of the background task scheduler:
//! - Scheduler configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
