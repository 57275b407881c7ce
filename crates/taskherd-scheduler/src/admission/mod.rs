//! Concurrency admission control for background tasks.
//!
//! - [`ConcurrencyGate`]: keyed semaphore with an independent capacity per
//!   key and strictly FIFO handoff between waiters of the same key.
//! - [`AdmissionPermit`]: a held slot, released on drop until it is handed
//!   to a task record.

pub mod gate;

pub use gate::{AdmissionPermit, ConcurrencyGate};
