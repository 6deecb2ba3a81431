//! Task specifications and the loader that reads them from disk.
//!
//! A task is a declarative JSON or YAML file (picked by extension). The file
//! stem becomes the task id. Timing fields are per-task with environment
//! fallbacks (`SCRIPT_TIMEOUT`, `SCRIPT_WAIT_TIME`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default wall-clock budget for the submitted script, in seconds.
const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 60;

/// Where the task's input files come from. Exactly one of `folder` or `file`
/// must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInputs {
    /// Folder copied recursively into the workspace, preserving structure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    /// Single file copied flat into the workspace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Optional ground-truth file copied flat alongside `file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth_file: Option<String>,
}

/// How the run is graded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultSpec {
    /// `ANSWER=<number>` compared with absolute tolerance 1e-9.
    Numerical { expected: f64 },
    /// `ANSWER=<value>` compared as text.
    String {
        expected: String,
        #[serde(default = "default_true")]
        case_sensitive: bool,
    },
    /// Tabular match of the task file against a ground-truth file.
    Classification {
        ground_truth_file: String,
        threshold: f64,
    },
    /// External checker script; passes iff it prints exactly `TRUE`.
    Checker { checker_script: String },
}

fn default_true() -> bool {
    true
}

impl ResultSpec {
    /// Stable label used in records and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            ResultSpec::Numerical { .. } => "numerical",
            ResultSpec::String { .. } => "string",
            ResultSpec::Classification { .. } => "classification",
            ResultSpec::Checker { .. } => "checker",
        }
    }
}

/// Files and folders pre-seeded into agent-backed sandbox workspaces,
/// resolved against the agent-assets root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentEnvSpec {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
}

/// Raw on-disk shape of a task spec file.
#[derive(Debug, Deserialize)]
struct RawTask {
    difficulty: String,
    description: String,
    #[serde(default)]
    inputs: TaskInputs,
    #[serde(default)]
    side_car_script: Option<String>,
    #[serde(default)]
    script_wait_seconds: Option<u64>,
    #[serde(default)]
    script_timeout_seconds: Option<u64>,
    result: ResultSpec,
    #[serde(default)]
    agent_env: Option<AgentEnvSpec>,
}

/// Immutable task specification.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable identifier: the spec-file stem.
    pub id: String,
    pub difficulty: String,
    pub description: String,
    pub inputs: TaskInputs,
    pub side_car_script: Option<String>,
    /// Minimum wall-clock delay between side-car start and script execution.
    pub script_wait_seconds: u64,
    /// Wall-clock budget for the submitted script.
    pub script_timeout_seconds: u64,
    pub result: ResultSpec,
    pub agent_env: Option<AgentEnvSpec>,
    /// Path the spec was loaded from.
    pub spec_path: PathBuf,
}

impl Task {
    /// Load a single task spec, validating the schema invariants.
    pub fn load_from_file(path: &Path) -> Result<Task> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read task spec {}", path.display()))?;

        let raw: RawTask = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .with_context(|| format!("parse YAML task spec {}", path.display()))?,
            _ => serde_json::from_str(&contents)
                .with_context(|| format!("parse JSON task spec {}", path.display()))?,
        };

        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("task")
            .to_string();

        let task = Task {
            id,
            difficulty: raw.difficulty,
            description: raw.description,
            inputs: raw.inputs,
            side_car_script: raw.side_car_script,
            script_wait_seconds: raw
                .script_wait_seconds
                .or_else(|| env_u64("SCRIPT_WAIT_TIME"))
                .unwrap_or(0),
            script_timeout_seconds: raw
                .script_timeout_seconds
                .or_else(|| env_u64("SCRIPT_TIMEOUT"))
                .unwrap_or(DEFAULT_SCRIPT_TIMEOUT_SECS),
            result: raw.result,
            agent_env: raw.agent_env,
            spec_path: path.to_path_buf(),
        };
        task.validate()?;
        Ok(task)
    }

    fn validate(&self) -> Result<()> {
        match (&self.inputs.folder, &self.inputs.file) {
            (Some(_), Some(_)) => {
                anyhow::bail!("task {}: inputs.folder and inputs.file are mutually exclusive", self.id)
            }
            (None, None) => {
                anyhow::bail!("task {}: inputs must set exactly one of folder or file", self.id)
            }
            _ => {}
        }
        if let ResultSpec::Classification { ground_truth_file, threshold } = &self.result {
            if ground_truth_file.is_empty() {
                anyhow::bail!("task {}: classification result requires ground_truth_file", self.id);
            }
            if !(0.0..=1.0).contains(threshold) {
                anyhow::bail!("task {}: classification threshold must be in [0, 1]", self.id);
            }
        }
        if let ResultSpec::Checker { checker_script } = &self.result {
            if checker_script.is_empty() {
                anyhow::bail!("task {}: checker result requires checker_script", self.id);
            }
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Loads every `*.yaml`, `*.yml`, and `*.json` spec under a directory.
pub struct TaskLoader;

impl TaskLoader {
    pub fn load_tasks(tasks_dir: &Path) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let entries = std::fs::read_dir(tasks_dir)
            .with_context(|| format!("read tasks directory {}", tasks_dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") {
                tasks.push(Task::load_from_file(&path)?);
            }
        }
        // Deterministic run order regardless of directory iteration order.
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;

    fn write_spec(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write spec");
        path
    }

    #[test]
    fn loads_yaml_spec_with_numerical_result() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_spec(
            tmp.path(),
            "count_lines.yaml",
            r#"
difficulty: easy
description: Count the lines.
inputs:
  file: logs/server.log
script_timeout_seconds: 120
result:
  kind: numerical
  expected: 42
"#,
        );
        let task = Task::load_from_file(&path).expect("load task");
        assert_eq!(task.id, "count_lines");
        assert_eq!(task.script_timeout_seconds, 120);
        assert_eq!(task.script_wait_seconds, 0);
        assert!(matches!(task.result, ResultSpec::Numerical { expected } if expected == 42.0));
    }

    #[test]
    fn loads_json_spec_with_checker_result() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_spec(
            tmp.path(),
            "video.json",
            r#"{
  "difficulty": "hard",
  "description": "Download the video.",
  "inputs": {"folder": "videos"},
  "side_car_script": "videos/server.py",
  "script_wait_seconds": 10,
  "result": {"kind": "checker", "checker_script": "videos/checker.py"}
}"#,
        );
        let task = Task::load_from_file(&path).expect("load task");
        assert_eq!(task.script_wait_seconds, 10);
        assert_eq!(task.result.kind(), "checker");
        assert_eq!(task.side_car_script.as_deref(), Some("videos/server.py"));
    }

    #[test]
    fn rejects_folder_and_file_together() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_spec(
            tmp.path(),
            "bad.yaml",
            r#"
difficulty: easy
description: Broken.
inputs:
  folder: data
  file: data/input.csv
result:
  kind: numerical
  expected: 1
"#,
        );
        let err = Task::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"), "{err}");
    }

    #[test]
    fn rejects_missing_inputs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_spec(
            tmp.path(),
            "empty.yaml",
            "difficulty: easy\ndescription: x\nresult:\n  kind: numerical\n  expected: 1\n",
        );
        assert!(Task::load_from_file(&path).is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_spec(
            tmp.path(),
            "cls.yaml",
            r#"
difficulty: medium
description: Classify.
inputs:
  file: reviews.csv
result:
  kind: classification
  ground_truth_file: truth.csv
  threshold: 1.5
"#,
        );
        let err = Task::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("threshold"), "{err}");
    }

    #[test]
    fn string_result_defaults_to_case_sensitive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_spec(
            tmp.path(),
            "title.yaml",
            r#"
difficulty: easy
description: Find the title.
inputs:
  file: books.csv
result:
  kind: string
  expected: Crimson Empire
"#,
        );
        let task = Task::load_from_file(&path).expect("load task");
        match task.result {
            ResultSpec::String { case_sensitive, .. } => assert!(case_sensitive),
            other => panic!("unexpected result spec: {other:?}"),
        }
    }

    #[test]
    fn loader_sorts_by_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let body = "difficulty: easy\ndescription: x\ninputs:\n  file: a.txt\nresult:\n  kind: numerical\n  expected: 1\n";
        write_spec(tmp.path(), "zeta.yaml", body);
        write_spec(tmp.path(), "alpha.yaml", body);
        write_spec(tmp.path(), "notes.txt", "ignored");
        let tasks = TaskLoader::load_tasks(tmp.path()).expect("load tasks");
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
