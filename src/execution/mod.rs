//! Task Execution Module
//!
//! Starts tasks as OS processes and watches them until they finish.
//!
//! # Architecture
//!
//! - [`backend`]: Spawns command tasks and worker processes
//! - `monitor`: Per-task watcher that samples memory and finalizes the task
//! - [`protocol`]: Request/reply messages exchanged with workers
//! - [`worker`]: Worker-side entry point and function registry
//! - [`samples`]: Built-in sample functions served by the `bear` binary

pub mod backend;
mod monitor;
pub mod protocol;
pub mod samples;
pub mod worker;

pub use backend::{Launcher, WorkerCommand, DEFAULT_POLL_INTERVAL, DEFAULT_RESULT_GRACE};
pub use protocol::{CallReply, CallRequest};
pub use worker::{serve, Registry, WORKER_ARG};
