//! Run-log directory management.
//!
//! Each run gets one timestamped directory holding the textual log, one JSON
//! record per task, one runnable script per task, per-task diagnostic
//! artifacts (agent trajectories), and the end-of-run summary.
//!
//! Resolution order for the logs root:
//!   1. `--logs-dir` CLI flag
//!   2. `SCRIPTBENCH_LOGS_DIR` environment variable
//!   3. `$XDG_DATA_HOME/scriptbench/logs`
//!   4. `~/.local/share/scriptbench/logs`
//!   5. `./logs`

use anyhow::{Context, Result};
use directories::BaseDirs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::schema::{timestamp_for_path, RunSummary, TaskResult};

/// Resolve the logs root following the priority chain.
pub fn resolve_logs_root(cli_root: Option<&str>) -> PathBuf {
    if let Some(root) = cli_root {
        return PathBuf::from(root);
    }
    if let Ok(root) = std::env::var("SCRIPTBENCH_LOGS_DIR") {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("scriptbench").join("logs");
        }
    }
    if let Some(base_dirs) = BaseDirs::new() {
        #[cfg(windows)]
        let base = base_dirs.data_local_dir().to_path_buf();
        #[cfg(not(windows))]
        let base = base_dirs.home_dir().join(".local").join("share");
        return base.join("scriptbench").join("logs");
    }
    PathBuf::from("logs")
}

/// Handle to one run's log directory.
pub struct RunLogger {
    pub run_dir: PathBuf,
    scripts_dir: PathBuf,
    tasks_dir: PathBuf,
}

impl RunLogger {
    /// Create `logs_root/run_<timestamp>/` with its subdirectories.
    pub fn create(logs_root: &Path) -> Result<Self> {
        let run_dir = logs_root.join(format!("run_{}", timestamp_for_path()));
        let scripts_dir = run_dir.join("scripts");
        let tasks_dir = run_dir.join("tasks");
        for dir in [&run_dir, &scripts_dir, &tasks_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create run log dir {}", dir.display()))?;
        }
        info!(run_dir = %run_dir.display(), "run log directory created");
        Ok(RunLogger { run_dir, scripts_dir, tasks_dir })
    }

    /// The textual log file for this run.
    pub fn log_file_path(&self) -> PathBuf {
        self.run_dir.join("benchmark.log")
    }

    /// Per-task directory for backend diagnostics (trajectories etc.).
    pub fn task_dir(&self, task_id: &str) -> Result<PathBuf> {
        let dir = self.tasks_dir.join(task_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create task artifact dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Persist the structured record for one task.
    pub fn save_task_record(&self, result: &TaskResult) -> Result<PathBuf> {
        let path = self.run_dir.join(format!("{}.json", result.task_id));
        let contents = serde_json::to_string_pretty(result)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("write task record {}", path.display()))?;
        info!(path = %path.display(), "task record saved");
        Ok(path)
    }

    /// Persist the submitted script so a human can run it directly.
    pub fn save_script(&self, task_id: &str, script: &str) -> Result<PathBuf> {
        let path = self.scripts_dir.join(format!("{task_id}.py"));
        std::fs::write(&path, script)
            .with_context(|| format!("write script {}", path.display()))?;
        info!(path = %path.display(), "script saved");
        Ok(path)
    }

    /// Persist the end-of-run summary.
    pub fn save_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.run_dir.join("summary.json");
        let contents = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("write summary {}", path.display()))?;
        info!(path = %path.display(), "run summary saved");
        Ok(path)
    }
}

// ---------- Unit tests ----------
