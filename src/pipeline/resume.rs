//! Resume Store
//!
//! Persists a snapshot of every known task, keyed by identity, so a
//! later run can skip tasks that already succeeded.
//!
//! The snapshot is one pretty-printed JSON object, rewritten in full
//! on every save through a temporary file and a rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::task::{Outcome, Task, TaskState};

/// Persisted attributes of one task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub timeout_secs: Option<f64>,
    pub reserved_mem: Option<u64>,
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub id: String,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub max_mem: Option<u64>,
    pub state: TaskState,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub func_name: String,
}

impl TaskRecord {
    /// Captures the current attributes of `task`.
    pub fn from_task(task: &Task) -> Self {
        let outcome = task.outcome();
        let options = task.options();

        Self {
            timeout_secs: options.timeout.map(|t| t.as_secs_f64()),
            reserved_mem: options.reserved_mem,
            args: task.args().to_vec(),
            kwargs: task.kwargs().clone(),
            id: task.id().to_string(),
            start_time: task.start_time(),
            end_time: outcome.as_ref().map(|o| o.end_time),
            max_mem: outcome.as_ref().map(|o| o.max_mem),
            state: outcome.as_ref().map_or_else(|| task.state(), |o| o.state),
            error: outcome.as_ref().and_then(|o| o.error.clone()),
            result: outcome.as_ref().and_then(|o| o.result.clone()),
            func_name: task.func_name().to_string(),
        }
    }

    /// Terminal outcome to copy onto a resumed task.
    fn to_outcome(&self) -> Outcome {
        let now = Local::now();
        let start_time = self.start_time.unwrap_or(now);
        Outcome::succeeded(
            start_time,
            self.end_time.unwrap_or(start_time),
            None,
            self.max_mem.unwrap_or(0),
            self.result.clone(),
        )
    }
}

/// On-disk snapshot of task records.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot.
    ///
    /// A missing, unreadable or corrupt snapshot is logged and treated
    /// as empty; resuming never fails a run.
    pub fn load(&self) -> HashMap<String, TaskRecord> {
        if !self.path.exists() {
            debug!("No resume snapshot at {}", self.path.display());
            return HashMap::new();
        }

        let parsed: std::result::Result<HashMap<String, TaskRecord>, String> =
            fs::read_to_string(&self.path)
                .map_err(|e| e.to_string())
                .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()));

        match parsed {
            Ok(records) => {
                info!(
                    "Loaded resume snapshot with {} tasks from {}",
                    records.len(),
                    self.path.display()
                );
                records
            }
            Err(e) => {
                warn!(
                    "Ignoring unreadable resume snapshot {}: {}",
                    self.path.display(),
                    e
                );
                HashMap::new()
            }
        }
    }

    /// Overwrites the snapshot with `records`.
    pub fn save(&self, records: &HashMap<String, TaskRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(records)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        info!(
            "Saved resume snapshot with {} tasks to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Records every task in `tasks` and saves the snapshot.
    pub fn save_tasks<'a, I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let records = tasks
            .into_iter()
            .map(|task| (task.id().to_string(), TaskRecord::from_task(task)))
            .collect();
        self.save(&records)
    }
}

/// Finishes `task` from its prior record if that run succeeded.
///
/// Returns `true` if the task was restored and must not be run.
pub(crate) fn restore(task: &Task, records: &HashMap<String, TaskRecord>) -> bool {
    let Some(record) = records.get(task.id()) else {
        return false;
    };
    if record.state != TaskState::Succeeded {
        return false;
    }

    if task.finish(record.to_outcome()) {
        info!("Task {} succeeded in a previous run, skipping", task.id());
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Caller, TaskOptions};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn task(args: Vec<Value>) -> Task {
        Task::new(
            Caller::function("add"),
            args,
            Map::new(),
            TaskOptions::default().with_timeout(Duration::from_secs(5)),
        )
    }

    fn succeeded(task: &Task, result: Value) {
        let start = Local::now();
        task.finish(Outcome::succeeded(
            start,
            start + chrono::Duration::seconds(2),
            Some(42),
            2048,
            Some(result),
        ));
    }

    #[test]
    fn test_record_from_finished_task() {
        let task = task(vec![json!(1), json!(2)]);
        succeeded(&task, json!(3));

        let record = TaskRecord::from_task(&task);
        assert_eq!(record.id, task.id());
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.result, Some(json!(3)));
        assert_eq!(record.max_mem, Some(2048));
        assert_eq!(record.timeout_secs, Some(5.0));
        assert_eq!(record.func_name, "add");
    }

    #[test]
    fn test_record_from_created_task() {
        let record = TaskRecord::from_task(&task(vec![]));
        assert_eq!(record.state, TaskState::Created);
        assert!(record.start_time.is_none());
        assert!(record.end_time.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path().join("nested").join("state.json"));

        let done = task(vec![json!(1), json!(2)]);
        succeeded(&done, json!(3));
        let pending = task(vec![json!(9)]);

        store.save_tasks([&done, &pending]).unwrap();
        let records = store.load();

        assert_eq!(records.len(), 2);
        assert_eq!(records[done.id()], TaskRecord::from_task(&done));
        assert_eq!(records[pending.id()].state, TaskState::Created);
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path().join("state.json"));
        store.save(&HashMap::new()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }

    #[test]
    fn test_load_missing_file() {
        let store = ResumeStore::new("/nonexistent/bear/state.json");
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(ResumeStore::new(&path).load().is_empty());
    }

    #[test]
    fn test_restore_succeeded() {
        let previous = task(vec![json!(1), json!(2)]);
        succeeded(&previous, json!(3));
        let records = HashMap::from([(previous.id().to_string(), TaskRecord::from_task(&previous))]);

        let current = task(vec![json!(1), json!(2)]);
        assert!(restore(&current, &records));
        assert_eq!(current.state(), TaskState::Succeeded);
        assert_eq!(current.wait().unwrap(), json!(3));
        assert_eq!(current.max_mem(), Some(2048));
        assert_eq!(current.duration(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_restore_skips_failed_and_unknown() {
        let previous = task(vec![json!(1)]);
        let now = Local::now();
        previous.finish(Outcome::failed(now, now, None, 0, "boom"));
        let records = HashMap::from([(previous.id().to_string(), TaskRecord::from_task(&previous))]);

        let retry = task(vec![json!(1)]);
        assert!(!restore(&retry, &records));
        assert_eq!(retry.state(), TaskState::Created);

        let changed = task(vec![json!(2)]);
        assert!(!restore(&changed, &records));
    }
}
