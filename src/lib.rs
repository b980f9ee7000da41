//! Bear - Local Task Orchestration
//!
//! Runs batches of shell commands or registered functions as separate
//! processes, bounds how many run at once, records each task's peak
//! memory across its process tree, and can skip tasks that succeeded
//! in an earlier run.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`task`]: The unit of work, its lifecycle and exported stats
//! - [`execution`]: Process launching, per-task monitors and the worker side
//! - [`pipeline`]: Batch orchestration, configuration and resume snapshots
//! - [`monitoring`]: Process-tree and host memory sampling, text charts
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use bear::{Batch, Pipeline, PipelineConfig};
//! use serde_json::json;
//!
//! fn main() -> bear::Result<()> {
//!     let config = PipelineConfig::default().with_resume(".bear/state.json");
//!     let mut pipeline = Pipeline::with_config(config)?;
//!
//!     let out = pipeline.dispatch_sync(
//!         Batch::command("gzip -k \"$1\"")
//!             .args(vec![vec![json!("a.txt")], vec![json!("b.txt")]])
//!             .concurrency(2),
//!     )?;
//!     println!("{:?}", out);
//!
//!     pipeline.save_stats("stats.json")?;
//!     Ok(())
//! }
//! ```
//!
//! Function tasks need a host program that serves its registry when
//! started with [`WORKER_ARG`]; see [`execution::worker`].

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod pipeline;
pub mod task;

// Re-export commonly used types
pub use error::{Error, Result, TaskFailure};
pub use execution::{Registry, WorkerCommand, WORKER_ARG};
pub use pipeline::{load_manifest, Batch, Manifest, Pipeline, PipelineConfig};
pub use task::{Caller, Task, TaskOptions, TaskState, TaskStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Bear";
