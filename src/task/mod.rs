//! Task Module
//!
//! The unit of work tracked by the engine and the summary it exports.
//!
//! - [`model`]: Task descriptor, caller variants, lifecycle and outcome
//! - [`stats`]: Per-task statistics and their JSON form

pub mod model;
pub mod stats;

pub use model::{identity, Caller, Outcome, StdioMode, Task, TaskOptions, TaskState};
pub use stats::{load_stats, save_stats, TaskStats};
