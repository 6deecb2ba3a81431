//! The per-task state machine: workspace → inference → side-car → packages →
//! wait gate → execution → evaluation → record.
//!
//! Tasks run sequentially. Any error raised by a subcomponent is caught at
//! the task boundary, categorised, and recorded; the run always continues
//! with the next task. The side-car is stopped and the workspace destroyed
//! on every exit path.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::backend::InferenceBackend;
use crate::evaluate::evaluate_result;
use crate::exec::{ExecOpts, ProcessExecutor};
use crate::failure::{categorize, TaskFailure};
use crate::install::PackageInstaller;
use crate::runlog::RunLogger;
use crate::schema::{now_rfc3339, TaskResult};
use crate::sidecar::{SideCarHandle, SideCarSupervisor};
use crate::task::Task;
use crate::workspace::{Workspace, WorkspaceProvisioner};

/// File name the submitted script is written to inside the workspace.
const SCRIPT_FILENAME: &str = "script.py";

/// Drives tasks from provisioning to a graded result.
pub struct Orchestrator {
    executor: ProcessExecutor,
    provisioner: WorkspaceProvisioner,
    installer: PackageInstaller,
    side_car: SideCarSupervisor,
    pub run_logger: RunLogger,
}

impl Orchestrator {
    pub fn new(assets_root: PathBuf, run_logger: RunLogger) -> Self {
        let executor = ProcessExecutor::new();
        Orchestrator {
            provisioner: WorkspaceProvisioner::new(assets_root.clone(), executor.clone()),
            installer: PackageInstaller::new(executor.clone()),
            side_car: SideCarSupervisor::new(assets_root),
            executor,
            run_logger,
        }
    }

    /// Run every task in order, collecting one record per task.
    pub fn run_all(&self, tasks: &[Task], backend: &mut dyn InferenceBackend) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            info!(task_id = %task.id, "[{}/{}] starting task", index + 1, tasks.len());
            let result = self.run_task(task, backend);
            let status = if result.passed { "PASSED" } else { "FAILED" };
            info!(task_id = %task.id, "[{}/{}] task {}: {}", index + 1, tasks.len(), task.id, status);
            results.push(result);
        }
        let passed = results.iter().filter(|r| r.passed).count();
        info!("benchmark complete: {passed}/{} tasks passed", results.len());
        results
    }

    /// Run one task to a final record. Never returns an error: failures land
    /// on the record, and teardown runs regardless of outcome.
    pub fn run_task(&self, task: &Task, backend: &mut dyn InferenceBackend) -> TaskResult {
        let started = Instant::now();
        let mut record =
            TaskResult::failed(&task.id, &task.difficulty, task.result.kind(), backend.name());
        record.timing.task_started_at = now_rfc3339();

        let mut workspace: Option<Workspace> = None;
        let mut side_car: Option<SideCarHandle> = None;

        let outcome =
            self.drive(task, backend, &mut record, &mut workspace, &mut side_car, started);
        if let Err(err) = outcome {
            record.passed = false;
            record.error_category = Some(categorize(&err).to_string());
            record.error = Some(format!("{err:#}"));
            error!(task_id = %task.id, category = %categorize(&err), "task failed: {err:#}");
        }

        // Teardown order: every child process first, then the workspace.
        if let Some(handle) = side_car.take() {
            self.side_car.stop(handle);
        }
        if let Some(ws) = workspace.take() {
            self.provisioner.teardown(&ws);
        }

        record.timing.task_finished_at = Some(now_rfc3339());
        record.timing.total_duration_seconds = Some(started.elapsed().as_secs_f64());

        if let Err(err) = self.run_logger.save_task_record(&record) {
            warn!(task_id = %task.id, %err, "failed to persist task record");
        }
        record
    }

    /// The linear state machine. Mutates the record as artifacts appear so a
    /// mid-flight failure still leaves everything gathered so far on it.
    fn drive(
        &self,
        task: &Task,
        backend: &mut dyn InferenceBackend,
        record: &mut TaskResult,
        workspace_slot: &mut Option<Workspace>,
        side_car_slot: &mut Option<SideCarHandle>,
        task_started: Instant,
    ) -> Result<()> {
        // INIT -> WORKSPACE_READY
        let workspace = self
            .provisioner
            .provision(task)
            .map_err(|err| TaskFailure::SetupError(format!("{err:#}")))?;
        *workspace_slot = Some(workspace.clone());

        // Non-agent backends get their side-car during provisioning so its
        // warm-up overlaps with inference.
        if task.side_car_script.is_some() && !backend.defers_side_car() {
            *side_car_slot = self.side_car.start(task)?;
            if side_car_slot.is_some() {
                record.timing.side_car_started_at = Some(now_rfc3339());
            }
        }

        // WORKSPACE_READY -> INFERRING -> SUBMISSION_READY
        let task_dir = self.run_logger.task_dir(&task.id)?;
        let submission = backend.produce(task, &task_dir)?;
        record.timing.inference_finished_at = Some(now_rfc3339());
        record.script_content = Some(submission.script_body.clone());
        record.backend_metadata = submission.backend_metadata.clone();
        if let Err(err) = self.run_logger.save_script(&task.id, &submission.script_body) {
            warn!(task_id = %task.id, %err, "failed to save script copy");
        }

        // SUBMISSION_READY -> SIDECAR_STARTING (deferred for agent backends,
        // so the agent's sandbox commands never collide with side-car
        // resources and warm-up overlaps with execution instead of the loop).
        if task.side_car_script.is_some() && backend.defers_side_car() {
            *side_car_slot = self.side_car.start(task)?;
            if side_car_slot.is_some() {
                record.timing.side_car_started_at = Some(now_rfc3339());
            }
        }

        // -> PACKAGES_INSTALLED (failures are metadata, never fatal)
        record.os_install = self.installer.install_os_packages(&submission.os_packages);
        record.interpreter_install = self
            .installer
            .install_interpreter_packages(&workspace, &submission.interpreter_packages);

        // -> WAIT_GATE: guarantee the side-car had script_wait_seconds of
        // wall clock before the script runs, however long inference took.
        if task.script_wait_seconds > 0 {
            let reference = side_car_slot
                .as_ref()
                .map(|handle| handle.started_at)
                .unwrap_or(task_started);
            let elapsed = reference.elapsed();
            let configured = Duration::from_secs(task.script_wait_seconds);
            if elapsed < configured {
                let remaining = configured - elapsed;
                info!(
                    task_id = %task.id,
                    configured_secs = task.script_wait_seconds,
                    elapsed_secs = elapsed.as_secs_f64(),
                    remaining_secs = remaining.as_secs_f64(),
                    "wait gate: sleeping"
                );
                std::thread::sleep(remaining);
                record.timing.wait_applied_seconds = Some(remaining.as_secs_f64());
            } else {
                info!(
                    task_id = %task.id,
                    configured_secs = task.script_wait_seconds,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "wait gate: already satisfied"
                );
                record.timing.wait_applied_seconds = Some(0.0);
            }
        }
        record.timing.wait_gate_released_at = Some(now_rfc3339());

        // -> EXECUTING
        let script_path = workspace.root.join(SCRIPT_FILENAME);
        std::fs::write(&script_path, &submission.script_body)
            .with_context(|| format!("write script {}", script_path.display()))?;

        info!(task_id = %task.id, timeout_secs = task.script_timeout_seconds, "executing submission");
        let execution = self.executor.execute(
            ExecOpts::new(
                vec![
                    workspace.python_path().display().to_string(),
                    script_path.display().to_string(),
                ],
                Duration::from_secs(task.script_timeout_seconds),
                "script",
            )
            .cwd(&workspace.root),
        );
        record.timing.execution_finished_at = Some(now_rfc3339());
        record.raw_output = execution.stdout.clone();

        if execution.timed_out {
            return Err(TaskFailure::ExecutionTimedOut {
                timeout_secs: task.script_timeout_seconds,
            }
            .into());
        }
        if let Some(spawn_err) = &execution.error {
            return Err(TaskFailure::ExecutionFailed { stderr: spawn_err.clone() }.into());
        }
        if execution.exit_code != Some(0) {
            return Err(TaskFailure::ExecutionFailed {
                stderr: execution.stderr.trim().to_string(),
            }
            .into());
        }

        // EXECUTING -> EVALUATING -> DONE
        let (passed, details) =
            evaluate_result(task, &execution.stdout, &workspace, &self.executor);
        record.passed = passed;
        record.evaluation_details = details;
        Ok(())
    }
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SingleShotBackend, Submission};
    use crate::model::ScriptedModel;
    use crate::task::{ResultSpec, TaskInputs};
    use serde_json::Value;
    use std::path::Path;

    fn python3_available() -> bool {
        std::process::Command::new(crate::workspace::host_python())
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn numerical_task(assets: &Path, expected: f64) -> Task {
        std::fs::write(assets.join("input.txt"), "data\n").unwrap();
        Task {
            id: "numeric".to_string(),
            difficulty: "easy".to_string(),
            description: "Print the answer.".to_string(),
            inputs: TaskInputs {
                folder: None,
                file: Some("input.txt".to_string()),
                ground_truth_file: None,
            },
            side_car_script: None,
            script_wait_seconds: 0,
            script_timeout_seconds: 60,
            result: ResultSpec::Numerical { expected },
            agent_env: None,
            spec_path: assets.join("numeric.yaml"),
        }
    }

    struct FailingBackend;

    impl InferenceBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn produce(&mut self, _task: &Task, _dir: &Path) -> anyhow::Result<Submission> {
            Err(TaskFailure::SubmissionAbsent.into())
        }
    }

    #[test]
    #[cfg(unix)]
    fn full_task_passes_and_cleans_up() {
        if !python3_available() {
            eprintln!("skipping: python3 not available");
            return;
        }
        let assets = tempfile::tempdir().expect("assets");
        let logs = tempfile::tempdir().expect("logs");
        let task = numerical_task(assets.path(), 42.0);

        let response = "```bash\n# no packages\n```\n```python\nprint('garbage')\nprint('ANSWER=42')\n```\n";
        let mut backend =
            SingleShotBackend::new(Box::new(ScriptedModel::new(vec![response.to_string()])));

        let run_logger = RunLogger::create(logs.path()).expect("run logger");
        let orchestrator = Orchestrator::new(assets.path().to_path_buf(), run_logger);
        let record = orchestrator.run_task(&task, &mut backend);

        assert!(record.passed, "error: {:?}", record.error);
        assert!(record.raw_output.contains("ANSWER=42"));
        assert_eq!(record.evaluation_details["extracted_answer"], Value::from(42.0));
        assert!(record.timing.total_duration_seconds.is_some());

        // The record and script copy landed in the run directory.
        assert!(orchestrator.run_logger.run_dir.join("numeric.json").is_file());
        assert!(orchestrator
            .run_logger
            .run_dir
            .join("scripts")
            .join("numeric.py")
            .is_file());

        // No workspace directory survives teardown.
        let leftovers: Vec<_> = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("scriptbench_numeric_"))
            .collect();
        assert!(leftovers.is_empty(), "workspaces left behind: {leftovers:?}");
    }

    #[test]
    #[cfg(unix)]
    fn backend_failure_is_categorised_and_recorded() {
        if !python3_available() {
            eprintln!("skipping: python3 not available");
            return;
        }
        let assets = tempfile::tempdir().expect("assets");
        let logs = tempfile::tempdir().expect("logs");
        let task = numerical_task(assets.path(), 1.0);

        let run_logger = RunLogger::create(logs.path()).expect("run logger");
        let orchestrator = Orchestrator::new(assets.path().to_path_buf(), run_logger);
        let record = orchestrator.run_task(&task, &mut FailingBackend);

        assert!(!record.passed);
        assert_eq!(record.error_category.as_deref(), Some("submission-absent"));
        assert!(record.error.is_some());
    }
}
