//! Resource Monitoring Module
//!
//! Provides utilities for tracking memory usage of task process trees
//! and of the host, and for presenting the collected numbers.
//!
//! # Components
//!
//! - [`ProcessTreeProbe`]: Peak RSS of a process and its descendants
//! - [`HostSampler`]: Periodic whole-machine memory samples
//! - [`ChartData`]: Data handed to chart renderers, plus text charts

pub mod chart;
pub mod resource;
pub mod system;

pub use chart::{duration_chart, format_bytes, memory_chart, ChartData};
pub use resource::ProcessTreeProbe;
pub use system::{HostSample, HostSampler, MIN_SAMPLE_INTERVAL};
