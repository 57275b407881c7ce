//! Background task records and the inputs that create or revive them.

mod types;

pub use types::{
    BackgroundTask, LaunchInput, ModelRef, ResumeInput, TaskProgress, TaskStatus, TrackInput,
    format_duration, new_task_id,
};
