//! Batch Manifest
//!
//! YAML description of the batches the `bear` binary runs.
//!
//! # Example YAML Format
//!
//! ```yaml
//! concurrency: 4
//! resume: true
//! resume_path: .bear/state.json
//! memory_monitor_interval: 1
//! batches:
//!   - function: add
//!     args: [[1, 2], [2, 3]]
//!     concurrency: 2
//!
//!   - command: "echo $1"
//!     args: [hello, world]
//!     timeout_secs: 30
//!     mode: async
//! ```
//!
//! An argument set that is a single value rather than a list is one
//! positional argument. A batch without `args` runs once with none.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::config::PipelineConfig;
use super::orchestrator::Batch;
use crate::error::{Error, Result};
use crate::monitoring::MIN_SAMPLE_INTERVAL;
use crate::task::{Caller, StdioMode, TaskOptions};

/// How the CLI dispatches a batch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Wait for the batch before starting the next one
    #[default]
    Sync,
    /// Start the batch and move on
    Async,
}

/// Top level of a manifest file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    /// Default ceiling for batches that set none
    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub resume: bool,

    #[serde(default)]
    pub resume_path: Option<PathBuf>,

    /// Host memory sampling interval in seconds
    #[serde(default)]
    pub memory_monitor_interval: Option<f64>,

    pub batches: Vec<BatchSpec>,
}

/// One batch of a manifest.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BatchSpec {
    /// Shell command (exclusive with `function`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Registered function name (exclusive with `command`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    /// Argument sets, one task each
    #[serde(default, deserialize_with = "arg_sets")]
    pub args: Vec<Vec<Value>>,

    /// Keyword arguments shared by every task of the batch
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub timeout_secs: Option<f64>,

    /// Advisory memory reservation in bytes
    #[serde(default)]
    pub reserved_mem: Option<u64>,

    #[serde(default)]
    pub mode: Mode,

    #[serde(default)]
    pub stdout: Option<StdioMode>,

    #[serde(default)]
    pub stderr: Option<StdioMode>,
}

/// Converts a number of seconds, rejecting values no `Duration` can hold.
pub(crate) fn seconds(field: &str, secs: f64) -> std::result::Result<Duration, String> {
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{} is out of range (got {}): {}", field, secs, e))
}

/// Deserializes a list whose items are either lists or single values.
fn arg_sets<'de, D>(deserializer: D) -> std::result::Result<Vec<Vec<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(args) => args,
                single => vec![single],
            })
            .collect(),
        single => vec![vec![single]],
    })
}

impl Manifest {
    /// Parses and validates manifest YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks every batch and the pipeline settings.
    pub fn validate(&self) -> Result<()> {
        if self.batches.is_empty() {
            return Err(Error::Manifest("no batches defined".to_string()));
        }

        if self.concurrency == Some(0) {
            return Err(Error::Manifest("concurrency must be at least 1".to_string()));
        }

        if let Some(secs) = self.memory_monitor_interval {
            if !secs.is_finite() || secs < MIN_SAMPLE_INTERVAL.as_secs_f64() {
                return Err(Error::Manifest(format!(
                    "memory_monitor_interval cannot be less than {} second (got {})",
                    MIN_SAMPLE_INTERVAL.as_secs(),
                    secs
                )));
            }
            seconds("memory_monitor_interval", secs).map_err(Error::Manifest)?;
        }

        for (index, batch) in self.batches.iter().enumerate() {
            batch
                .validate()
                .map_err(|e| Error::Manifest(format!("batch {}: {}", index + 1, e)))?;
        }

        Ok(())
    }

    /// Applies the manifest's pipeline settings on top of `base`.
    pub fn pipeline_config(&self, mut base: PipelineConfig) -> Result<PipelineConfig> {
        base.resume = base.resume || self.resume;
        if let Some(path) = &self.resume_path {
            base.resume_path = path.clone();
        }
        if let Some(secs) = self.memory_monitor_interval {
            let interval = seconds("memory_monitor_interval", secs).map_err(Error::Manifest)?;
            base.memory_monitor_interval = Some(interval);
        }
        Ok(base)
    }

    /// Total number of tasks across all batches.
    pub fn task_count(&self) -> usize {
        self.batches.iter().map(BatchSpec::task_count).sum()
    }
}

impl BatchSpec {
    /// The batch's caller, if exactly one of `command`/`function` is set.
    pub fn caller(&self) -> std::result::Result<Caller, String> {
        match (&self.command, &self.function) {
            (Some(command), None) if !command.trim().is_empty() => Ok(Caller::command(command)),
            (None, Some(function)) if !function.trim().is_empty() => Ok(Caller::function(function)),
            (Some(_), Some(_)) => Err("set either 'command' or 'function', not both".to_string()),
            (None, None) => Err("one of 'command' or 'function' is required".to_string()),
            _ => Err("caller must not be empty".to_string()),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        self.caller()?;

        if self.concurrency == Some(0) {
            return Err("concurrency must be at least 1".to_string());
        }

        if let Some(secs) = self.timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(format!("timeout_secs must be a positive number (got {})", secs));
            }
            seconds("timeout_secs", secs)?;
        }

        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.args.len().max(1)
    }

    /// Builds the batch, falling back to `default_concurrency` when the
    /// batch sets no ceiling of its own.
    pub fn to_batch(&self, default_concurrency: Option<usize>) -> Result<Batch> {
        self.validate().map_err(Error::Manifest)?;
        let caller = self.caller().map_err(Error::Manifest)?;

        let mut options = TaskOptions::default();
        if let Some(secs) = self.timeout_secs {
            options = options.with_timeout(seconds("timeout_secs", secs).map_err(Error::Manifest)?);
        }
        if let Some(bytes) = self.reserved_mem {
            options = options.with_reserved_mem(bytes);
        }
        if let Some(mode) = &self.stdout {
            options = options.with_stdout(mode.clone());
        }
        if let Some(mode) = &self.stderr {
            options = options.with_stderr(mode.clone());
        }

        let arg_sets = if self.args.is_empty() {
            vec![Vec::new()]
        } else {
            self.args.clone()
        };

        let mut batch = Batch::new(caller)
            .args(arg_sets)
            .kwargs(self.kwargs.clone())
            .options(options);
        if let Some(ceiling) = self.concurrency.or(default_concurrency) {
            batch = batch.concurrency(ceiling);
        }
        Ok(batch)
    }
}

/// Loads and validates a manifest file.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest> {
    let path = path.as_ref();
    info!("Loading manifest from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|e| {
        Error::Manifest(format!(
            "failed to read '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;
    debug!("YAML content loaded ({} bytes)", yaml.len());

    let manifest = Manifest::from_yaml(&yaml)?;
    info!(
        "Parsed {} batches, {} tasks",
        manifest.batches.len(),
        manifest.task_count()
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const FULL: &str = r#"
concurrency: 4
resume: true
resume_path: /tmp/bear-state.json
memory_monitor_interval: 2
batches:
  - function: add
    args: [[1, 2], [2, 3]]
    kwargs: {}
    concurrency: 2
    timeout_secs: 30
    reserved_mem: 1048576
    mode: sync
  - command: "echo $1"
    args: [hello, [world]]
    mode: async
    stdout: inherit
"#;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = Manifest::from_yaml(FULL).unwrap();

        assert_eq!(manifest.concurrency, Some(4));
        assert!(manifest.resume);
        assert_eq!(manifest.batches.len(), 2);
        assert_eq!(manifest.task_count(), 4);

        let add = &manifest.batches[0];
        assert_eq!(add.caller().unwrap(), Caller::function("add"));
        assert_eq!(add.args, vec![vec![json!(1), json!(2)], vec![json!(2), json!(3)]]);
        assert_eq!(add.mode, Mode::Sync);

        let echo = &manifest.batches[1];
        assert_eq!(echo.args, vec![vec![json!("hello")], vec![json!("world")]]);
        assert_eq!(echo.mode, Mode::Async);
        assert_eq!(echo.stdout, Some(StdioMode::Inherit));
    }

    #[test]
    fn test_batch_conversion() {
        let manifest = Manifest::from_yaml(FULL).unwrap();

        let add = manifest.batches[0].to_batch(manifest.concurrency).unwrap();
        assert_eq!(add.len(), 2);
        assert_eq!(add.ceiling(), Some(2));

        let echo = manifest.batches[1].to_batch(manifest.concurrency).unwrap();
        assert_eq!(echo.ceiling(), Some(4));
        assert_eq!(echo.caller(), &Caller::command("echo $1"));
    }

    #[test]
    fn test_missing_args_runs_once() {
        let manifest = Manifest::from_yaml("batches:\n  - command: date\n").unwrap();
        let batch = manifest.batches[0].to_batch(None).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.ceiling(), None);
        assert_eq!(manifest.batches[0].mode, Mode::Sync);
    }

    #[test]
    fn test_caller_is_exclusive() {
        let both = "batches:\n  - command: date\n    function: add\n";
        assert!(matches!(Manifest::from_yaml(both), Err(Error::Manifest(_))));

        let neither = "batches:\n  - args: [[1]]\n";
        let err = Manifest::from_yaml(neither).unwrap_err();
        assert!(err.to_string().contains("batch 1"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Manifest::from_yaml("batches: []\n").is_err());
        assert!(Manifest::from_yaml("concurrency: 0\nbatches:\n  - command: date\n").is_err());
        assert!(Manifest::from_yaml("memory_monitor_interval: 0.5\nbatches:\n  - command: date\n").is_err());
        assert!(Manifest::from_yaml("batches:\n  - command: date\n    timeout_secs: -1\n").is_err());
        assert!(Manifest::from_yaml("batches:\n  - command: date\n    concurrency: 0\n").is_err());
    }

    #[test]
    fn test_rejects_unrepresentable_durations() {
        let interval = Manifest::from_yaml("memory_monitor_interval: 1e20\nbatches:\n  - command: date\n");
        assert!(matches!(interval, Err(Error::Manifest(ref m)) if m.contains("out of range")));

        let timeout = Manifest::from_yaml("batches:\n  - command: date\n    timeout_secs: 1e20\n");
        assert!(matches!(timeout, Err(Error::Manifest(ref m)) if m.contains("batch 1")));
    }

    #[test]
    fn test_conversion_checks_durations() {
        let mut manifest = Manifest::from_yaml(FULL).unwrap();
        manifest.memory_monitor_interval = Some(1e20);
        assert!(manifest.pipeline_config(PipelineConfig::default()).is_err());

        let mut spec = manifest.batches[0].clone();
        spec.timeout_secs = Some(1e20);
        assert!(matches!(spec.to_batch(None), Err(Error::Manifest(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(Manifest::from_yaml("batches: [unclosed"), Err(Error::Yaml(_))));
    }

    #[test]
    fn test_pipeline_config_overrides() {
        let manifest = Manifest::from_yaml(FULL).unwrap();
        let config = manifest.pipeline_config(PipelineConfig::default()).unwrap();

        assert!(config.resume);
        assert_eq!(config.resume_path, PathBuf::from("/tmp/bear-state.json"));
        assert_eq!(config.memory_monitor_interval, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_load_manifest_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("batches.yaml");
        fs::write(&path, FULL).unwrap();

        assert_eq!(load_manifest(&path).unwrap().batches.len(), 2);
    }

    #[test]
    fn test_load_missing_manifest() {
        let err = load_manifest("/nonexistent/batches.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
