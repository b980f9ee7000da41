//! Task Statistics
//!
//! Read-only per-task summaries, exported as a JSON array for
//! downstream charting.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use super::model::{Outcome, Task};
use crate::error::Result;

/// Clock format of the `start` and `end` fields.
const CLOCK_FORMAT: &str = "%H:%M:%S";

/// Summary of one finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub id: String,
    /// Start time as `HH:MM:SS`
    pub start: String,
    /// End time as `HH:MM:SS`
    pub end: String,
    /// Run time in seconds
    pub duration: f64,
    /// Peak resident memory in bytes
    pub max_mem: u64,
    pub func_name: String,
    pub group_id: usize,
}

impl TaskStats {
    /// Builds the summary of `task` from its terminal outcome.
    pub fn new(task: &Task, outcome: &Outcome) -> Self {
        Self {
            id: task.id().to_string(),
            start: outcome.start_time.format(CLOCK_FORMAT).to_string(),
            end: outcome.end_time.format(CLOCK_FORMAT).to_string(),
            duration: outcome.duration().as_secs_f64(),
            max_mem: outcome.max_mem,
            func_name: task.func_name().to_string(),
            group_id: task.group_id(),
        }
    }
}

/// Writes stats as a JSON array.
pub fn save_stats(path: impl AsRef<Path>, stats: &[TaskStats]) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(stats)?;
    fs::write(path, json)?;
    info!("Saved stats for {} tasks to {}", stats.len(), path.display());
    Ok(())
}

/// Reads stats previously written by [`save_stats`].
pub fn load_stats(path: impl AsRef<Path>) -> Result<Vec<TaskStats>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{Caller, TaskOptions};
    use chrono::{Local, TimeZone};
    use serde_json::{json, Map};
    use tempfile::tempdir;

    fn finished_task() -> (Task, Outcome) {
        let task = Task::new(
            Caller::command("sleep 1"),
            Vec::new(),
            Map::new(),
            TaskOptions::default(),
        );
        let start = Local.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap();
        let end = start + chrono::Duration::milliseconds(2250);
        let outcome = Outcome::succeeded(start, end, Some(10), 4096, Some(json!("")));
        (task, outcome)
    }

    #[test]
    fn test_stats_fields() {
        let (task, outcome) = finished_task();
        let stats = TaskStats::new(&task, &outcome);

        assert_eq!(stats.id, task.id());
        assert_eq!(stats.start, "09:05:07");
        assert_eq!(stats.end, "09:05:09");
        assert_eq!(stats.duration, 2.25);
        assert_eq!(stats.max_mem, 4096);
        assert_eq!(stats.func_name, "sleep 1");
        assert_eq!(stats.group_id, 0);
    }

    #[test]
    fn test_stats_json_shape() {
        let (task, outcome) = finished_task();
        let value = serde_json::to_value(TaskStats::new(&task, &outcome)).unwrap();

        for field in ["id", "start", "end", "duration", "max_mem", "func_name", "group_id"] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_save_and_load_stats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let (task, outcome) = finished_task();
        let stats = vec![TaskStats::new(&task, &outcome)];

        save_stats(&path, &stats).unwrap();
        let loaded = load_stats(&path).unwrap();

        assert_eq!(loaded, stats);
    }

    #[test]
    fn test_load_stats_missing_file() {
        assert!(load_stats("/nonexistent/stats.json").is_err());
    }
}
