//! Pipeline Configuration

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::execution::{WorkerCommand, DEFAULT_POLL_INTERVAL, DEFAULT_RESULT_GRACE};
use crate::monitoring::MIN_SAMPLE_INTERVAL;

/// Default resume snapshot location, `~/.bear/state.json`.
pub static DEFAULT_RESUME_PATH: Lazy<PathBuf> = Lazy::new(|| {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    PathBuf::from(home).join(".bear").join("state.json")
});

/// Settings shared by every batch a [`Pipeline`](super::Pipeline) runs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Skip tasks that succeeded in a previous run and save a snapshot
    /// after each synchronous batch
    pub resume: bool,
    /// Snapshot file used when `resume` is set
    pub resume_path: PathBuf,
    /// Host memory sampling interval; `None` disables the sampler
    pub memory_monitor_interval: Option<Duration>,
    /// Program that serves function tasks
    pub worker: WorkerCommand,
    /// Interval between process-tree memory samples
    pub poll_interval: Duration,
    /// How long a finished task's output may take to arrive
    pub result_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resume: false,
            resume_path: DEFAULT_RESUME_PATH.clone(),
            memory_monitor_interval: None,
            worker: WorkerCommand::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            result_grace: DEFAULT_RESULT_GRACE,
        }
    }
}

impl PipelineConfig {
    pub fn with_resume(mut self, path: impl Into<PathBuf>) -> Self {
        self.resume = true;
        self.resume_path = path.into();
        self
    }

    pub fn with_memory_monitor(mut self, interval: Duration) -> Self {
        self.memory_monitor_interval = Some(interval);
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Checks every setting, reporting the first problem found.
    pub fn validate(&self) -> Result<()> {
        if let Some(interval) = self.memory_monitor_interval {
            if interval < MIN_SAMPLE_INTERVAL {
                return Err(Error::InvalidConfig(format!(
                    "memory monitor interval must be at least {:?}, got {:?}",
                    MIN_SAMPLE_INTERVAL, interval
                )));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }

        if self.resume && self.resume_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "resume requires a snapshot path".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.resume);
        assert!(config.memory_monitor_interval.is_none());
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_default_resume_path() {
        assert!(DEFAULT_RESUME_PATH.ends_with(".bear/state.json"));
    }

    #[test]
    fn test_monitor_interval_too_small() {
        let config = PipelineConfig::default().with_memory_monitor(Duration::from_millis(500));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_poll_interval() {
        let config = PipelineConfig::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_resume_without_path() {
        let config = PipelineConfig::default().with_resume("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resume_builder() {
        let config = PipelineConfig::default().with_resume("/tmp/bear.json");
        assert!(config.resume);
        assert_eq!(config.resume_path, PathBuf::from("/tmp/bear.json"));
    }
}
