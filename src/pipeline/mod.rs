//! Pipeline Module
//!
//! Batch orchestration and everything it is configured from.
//!
//! - [`orchestrator`]: [`Pipeline`] and [`Batch`], admission and waiting
//! - [`config`]: Programmatic pipeline settings
//! - [`manifest`]: YAML batch manifests for the CLI
//! - [`resume`]: Snapshot store used to skip succeeded tasks

pub mod config;
pub mod manifest;
pub mod orchestrator;
pub mod resume;

pub use config::{PipelineConfig, DEFAULT_RESUME_PATH};
pub use manifest::{load_manifest, BatchSpec, Manifest, Mode};
pub use orchestrator::{Batch, Pipeline};
pub use resume::{ResumeStore, TaskRecord};
