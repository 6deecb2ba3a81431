//! Persisted record types: per-task results, timing checkpoints, and the
//! end-of-run summary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::install::InstallReport;

/// Wall-clock checkpoints recorded at every orchestrator transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingCheckpoints {
    pub task_started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_car_started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_gate_released_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_seconds: Option<f64>,
    /// Extra sleep applied by the wait gate, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_applied_seconds: Option<f64>,
}

/// The final record for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub passed: bool,
    pub difficulty: String,
    pub result_kind: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    /// Stdout of the submitted script.
    pub raw_output: String,
    pub evaluation_details: Value,
    pub timing: TimingCheckpoints,
    pub os_install: InstallReport,
    pub interpreter_install: InstallReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_content: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub backend_metadata: Value,
}

impl TaskResult {
    /// Failure record used before any artifacts exist.
    pub fn failed(task_id: &str, difficulty: &str, result_kind: &str, backend: &str) -> Self {
        TaskResult {
            task_id: task_id.to_string(),
            passed: false,
            difficulty: difficulty.to_string(),
            result_kind: result_kind.to_string(),
            backend: backend.to_string(),
            error: None,
            error_category: None,
            raw_output: String::new(),
            evaluation_details: Value::Null,
            timing: TimingCheckpoints::default(),
            os_install: InstallReport::default(),
            interpreter_install: InstallReport::default(),
            script_content: None,
            backend_metadata: Value::Null,
        }
    }
}

/// Per-category pass statistics for the run summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total: usize,
    pub passed: usize,
    pub pass_rate: f64,
}

/// End-of-run summary document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub model: String,
    pub backend: String,
    pub finished_at: String,
    pub total_tasks: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_percentage: f64,
    pub total_duration_seconds: f64,
    pub by_difficulty: BTreeMap<String, CategoryStats>,
    pub by_result_kind: BTreeMap<String, CategoryStats>,
}

impl RunSummary {
    pub fn from_results(results: &[TaskResult], model: &str, backend: &str) -> Self {
        let total_tasks = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let total_duration_seconds = results
            .iter()
            .filter_map(|r| r.timing.total_duration_seconds)
            .sum();

        let mut by_difficulty: BTreeMap<String, CategoryStats> = BTreeMap::new();
        let mut by_result_kind: BTreeMap<String, CategoryStats> = BTreeMap::new();
        for result in results {
            let entry = by_difficulty.entry(result.difficulty.clone()).or_default();
            entry.total += 1;
            if result.passed {
                entry.passed += 1;
            }
            let entry = by_result_kind.entry(result.result_kind.clone()).or_default();
            entry.total += 1;
            if result.passed {
                entry.passed += 1;
            }
        }
        for stats in by_difficulty.values_mut().chain(by_result_kind.values_mut()) {
            stats.pass_rate = if stats.total > 0 {
                stats.passed as f64 / stats.total as f64 * 100.0
            } else {
                0.0
            };
        }

        RunSummary {
            model: model.to_string(),
            backend: backend.to_string(),
            finished_at: now_rfc3339(),
            total_tasks,
            passed,
            failed: total_tasks - passed,
            pass_percentage: if total_tasks > 0 {
                passed as f64 / total_tasks as f64 * 100.0
            } else {
                0.0
            },
            total_duration_seconds,
            by_difficulty,
            by_result_kind,
        }
    }
}

// ---------- Timestamps ----------

/// Current UTC time as RFC 3339, without pulling in a date-time crate.
pub fn now_rfc3339() -> String {
    let d = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_rfc3339(d.as_secs())
}

fn format_rfc3339(secs: u64) -> String {
    let mut s = secs;
    let seconds = s % 60;
    s /= 60;
    let minutes = s % 60;
    s /= 60;
    let hours = s % 24;
    s /= 24;

    // Days since 1970-01-01
    let mut days = s;
    let mut year = 1970u64;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let leap = is_leap(year);
    let month_days: [u64; 12] = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0usize;
    for (i, &d) in month_days.iter().enumerate() {
        if days < d {
            month = i;
            break;
        }
        days -= d;
    }
    let day = days + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month + 1,
        day,
        hours,
        minutes,
        seconds
    )
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Timestamp safe to embed in a directory name.
pub fn timestamp_for_path() -> String {
    now_rfc3339()
        .replace([':', '-'], "")
        .replace('T', "_")
        .trim_end_matches('Z')
        .to_string()
}

// ---------- Unit tests ----------
