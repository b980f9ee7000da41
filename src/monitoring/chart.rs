//! Chart Data and Text Charts
//!
//! The data handed to charting consumers, plus plain-text bar charts
//! of per-task duration and peak memory for terminal reports.

use serde::{Deserialize, Serialize};

use super::system::HostSample;
use crate::task::TaskStats;

/// Width of the longest bar, in characters.
const BAR_WIDTH: f64 = 50.0;

/// Width of the label column.
const LABEL_WIDTH: usize = 16;

/// Everything a chart renderer needs: per-task stats and the host
/// memory log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartData {
    pub tasks: Vec<TaskStats>,
    pub host: Vec<HostSample>,
}

/// Bar chart of task durations, one row per task.
pub fn duration_chart(stats: &[TaskStats]) -> String {
    let rows: Vec<(String, f64, String)> = stats
        .iter()
        .map(|s| (label(s), s.duration, format!("{:.2} s", s.duration)))
        .collect();
    render("Task Durations", rows)
}

/// Bar chart of task peak memory, one row per task.
pub fn memory_chart(stats: &[TaskStats]) -> String {
    let rows: Vec<(String, f64, String)> = stats
        .iter()
        .map(|s| (label(s), s.max_mem as f64, format_bytes(s.max_mem)))
        .collect();
    render("Task Peak Memory", rows)
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn label(stats: &TaskStats) -> String {
    format!("{}:{}", stats.group_id, stats.func_name)
}

fn render(title: &str, rows: Vec<(String, f64, String)>) -> String {
    let mut output = format!("\n{}:\n\n", title);

    let max = rows.iter().map(|(_, v, _)| *v).fold(0.0_f64, f64::max);
    if rows.is_empty() || max <= 0.0 {
        return output;
    }

    let scale = BAR_WIDTH / max;
    for (name, value, text) in rows {
        let len = ((value * scale) as usize).max(1);
        output.push_str(&format!(
            "{} |{:<width$}| {}\n",
            truncate(&name, LABEL_WIDTH),
            "#".repeat(len),
            text,
            width = BAR_WIDTH as usize
        ));
    }
    output
}

/// Pads or shortens a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
