//! Per-task workspace provisioning and teardown.
//!
//! A workspace is a uniquely named directory under the system temp root plus
//! a fresh virtual environment at `workspace/venv`. The orchestrator owns it
//! exclusively for the duration of one task and tears it down on exit
//! regardless of outcome.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use ulid::Ulid;

use crate::exec::{ExecOpts, ProcessExecutor};
use crate::task::{ResultSpec, Task};

/// Directory name of the isolated interpreter environment inside a workspace.
pub const VENV_DIRNAME: &str = "venv";

const VENV_CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Host interpreter used to bootstrap virtual environments and run side-cars.
pub fn host_python() -> &'static str {
    if cfg!(windows) { "python" } else { "python3" }
}

/// A provisioned workspace: the directory plus its venv.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub venv: PathBuf,
}

impl Workspace {
    pub fn python_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv.join("Scripts").join("python.exe")
        } else {
            self.venv.join("bin").join("python")
        }
    }

    pub fn pip_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv.join("Scripts").join("pip.exe")
        } else {
            self.venv.join("bin").join("pip")
        }
    }

    /// Directory holding the venv launchers, for `PATH` prepending.
    pub fn venv_bin(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv.join("Scripts")
        } else {
            self.venv.join("bin")
        }
    }
}

/// Creates and destroys workspaces, materialising task inputs into them.
pub struct WorkspaceProvisioner {
    /// Root the task `inputs` paths are resolved against.
    assets_root: PathBuf,
    executor: ProcessExecutor,
}

impl WorkspaceProvisioner {
    pub fn new(assets_root: PathBuf, executor: ProcessExecutor) -> Self {
        WorkspaceProvisioner { assets_root, executor }
    }

    /// Provision a workspace for one task: unique directory, task inputs,
    /// checker script (when graded by checker), fresh venv.
    pub fn provision(&self, task: &Task) -> Result<Workspace> {
        let root = unique_workspace_dir(&task.id)?;
        info!(task_id = %task.id, workspace = %root.display(), "workspace created");

        self.materialize_inputs(task, &root);
        if let ResultSpec::Checker { checker_script } = &task.result {
            self.copy_flat(checker_script, &root);
        }

        let venv = self.create_venv(&root)?;
        Ok(Workspace { root, venv })
    }

    /// Provision a bare workspace (no task inputs) for an agent sandbox.
    pub fn provision_bare(&self, label: &str) -> Result<Workspace> {
        let root = unique_workspace_dir(label)?;
        info!(label, workspace = %root.display(), "sandbox workspace created");
        let venv = self.create_venv(&root)?;
        Ok(Workspace { root, venv })
    }

    /// Copy the task's declared inputs into the workspace. Missing sources
    /// are logged and skipped so a misdeclared task still runs to an
    /// evaluation failure instead of aborting setup.
    pub fn materialize_inputs(&self, task: &Task, root: &Path) {
        if let Some(folder) = &task.inputs.folder {
            let rel = folder.trim_matches('/');
            let source = self.assets_root.join(rel);
            let destination = root.join(rel);
            if source.is_dir() {
                info!(source = %source.display(), destination = %destination.display(), "copying task folder");
                if let Err(err) = copy_dir_recursive(&source, &destination) {
                    warn!(%err, "task folder copy failed");
                }
            } else {
                warn!(source = %source.display(), "task folder does not exist");
            }
        }
        if let Some(file) = &task.inputs.file {
            self.copy_flat(file, root);
        }
        if let Some(ground_truth) = &task.inputs.ground_truth_file {
            self.copy_flat(ground_truth, root);
        }
    }

    /// Copy a single asset into the workspace root, dropping its parent dirs.
    fn copy_flat(&self, rel_path: &str, root: &Path) {
        let source = self.assets_root.join(rel_path.trim_matches('/'));
        let Some(name) = source.file_name() else {
            warn!(path = %rel_path, "asset path has no file name");
            return;
        };
        let destination = root.join(name);
        if source.is_file() {
            info!(source = %source.display(), destination = %destination.display(), "copying task file");
            if let Err(err) = std::fs::copy(&source, &destination) {
                warn!(%err, "task file copy failed");
            }
        } else {
            warn!(source = %source.display(), "task file does not exist");
        }
    }

    /// Create `root/venv` with the host toolchain. Symlinked launchers keep
    /// the embedded pip usable from inside the environment.
    fn create_venv(&self, root: &Path) -> Result<PathBuf> {
        let venv = root.join(VENV_DIRNAME);
        let mut argv = vec![
            host_python().to_string(),
            "-m".to_string(),
            "venv".to_string(),
        ];
        if cfg!(unix) {
            argv.push("--symlinks".to_string());
        }
        argv.push(venv.display().to_string());

        info!(venv = %venv.display(), "creating virtual environment");
        let result = self
            .executor
            .execute(ExecOpts::new(argv, VENV_CREATE_TIMEOUT, "venv"));
        if !result.success() {
            anyhow::bail!(
                "virtual environment creation failed (exit {:?}): {}",
                result.exit_code,
                if result.stderr.is_empty() { &result.stdout } else { &result.stderr }
            );
        }
        Ok(venv)
    }

    /// Best-effort teardown: delete the workspace tree. A failure is logged
    /// and swallowed; it never propagates into the task result.
    pub fn teardown(&self, workspace: &Workspace) {
        if workspace.root.exists() {
            match std::fs::remove_dir_all(&workspace.root) {
                Ok(()) => info!(workspace = %workspace.root.display(), "workspace removed"),
                Err(err) => {
                    warn!(workspace = %workspace.root.display(), %err, "workspace teardown failed")
                }
            }
        }
    }
}

/// `$TMPDIR/scriptbench_<sanitised-label>_<ulid>`.
fn unique_workspace_dir(label: &str) -> Result<PathBuf> {
    let sanitised: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let dir = std::env::temp_dir().join(format!("scriptbench_{sanitised}_{}", Ulid::new()));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create workspace dir {}", dir.display()))?;
    Ok(dir)
}

fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)
        .with_context(|| format!("create dir {}", destination.display()))?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskInputs;

    fn task_with_inputs(inputs: TaskInputs) -> Task {
        Task {
            id: "sample".to_string(),
            difficulty: "easy".to_string(),
            description: "sample".to_string(),
            inputs,
            side_car_script: None,
            script_wait_seconds: 0,
            script_timeout_seconds: 60,
            result: ResultSpec::Numerical { expected: 1.0 },
            agent_env: None,
            spec_path: PathBuf::from("sample.yaml"),
        }
    }

    #[test]
    fn unique_dirs_do_not_collide_and_sanitise_labels() {
        let a = unique_workspace_dir("my task/1").expect("dir a");
        let b = unique_workspace_dir("my task/1").expect("dir b");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("scriptbench_my_task_1_"), "{name}");
        std::fs::remove_dir_all(&a).ok();
        std::fs::remove_dir_all(&b).ok();
    }

    #[test]
    fn materialises_file_inputs_flat() {
        let assets = tempfile::tempdir().expect("assets");
        let nested = assets.path().join("data");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("input.csv"), "a,b\n1,2\n").unwrap();
        std::fs::write(nested.join("truth.csv"), "a,b\n1,2\n").unwrap();

        let ws = tempfile::tempdir().expect("workspace");
        let provisioner =
            WorkspaceProvisioner::new(assets.path().to_path_buf(), ProcessExecutor::new());
        let task = task_with_inputs(TaskInputs {
            folder: None,
            file: Some("data/input.csv".to_string()),
            ground_truth_file: Some("data/truth.csv".to_string()),
        });
        provisioner.materialize_inputs(&task, ws.path());

        // Flat copies: no data/ parent in the workspace.
        assert!(ws.path().join("input.csv").is_file());
        assert!(ws.path().join("truth.csv").is_file());
        assert!(!ws.path().join("data").exists());
    }

    #[test]
    fn materialises_folder_inputs_preserving_structure() {
        let assets = tempfile::tempdir().expect("assets");
        let tree = assets.path().join("videos").join("clips");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("a.mp4"), b"x").unwrap();
        std::fs::write(assets.path().join("videos").join("index.txt"), b"y").unwrap();

        let ws = tempfile::tempdir().expect("workspace");
        let provisioner =
            WorkspaceProvisioner::new(assets.path().to_path_buf(), ProcessExecutor::new());
        let task = task_with_inputs(TaskInputs {
            folder: Some("videos".to_string()),
            file: None,
            ground_truth_file: None,
        });
        provisioner.materialize_inputs(&task, ws.path());

        assert!(ws.path().join("videos").join("index.txt").is_file());
        assert!(ws.path().join("videos").join("clips").join("a.mp4").is_file());
    }

    #[test]
    fn missing_inputs_are_skipped_not_fatal() {
        let assets = tempfile::tempdir().expect("assets");
        let ws = tempfile::tempdir().expect("workspace");
        let provisioner =
            WorkspaceProvisioner::new(assets.path().to_path_buf(), ProcessExecutor::new());
        let task = task_with_inputs(TaskInputs {
            folder: None,
            file: Some("nope/missing.csv".to_string()),
            ground_truth_file: None,
        });
        provisioner.materialize_inputs(&task, ws.path());
        assert_eq!(std::fs::read_dir(ws.path()).unwrap().count(), 0);
    }

    #[test]
    fn teardown_removes_the_tree_and_tolerates_absence() {
        let provisioner =
            WorkspaceProvisioner::new(PathBuf::from("unused"), ProcessExecutor::new());
        let root = unique_workspace_dir("teardown").expect("dir");
        std::fs::write(root.join("marker"), b"x").unwrap();
        let ws = Workspace { venv: root.join(VENV_DIRNAME), root: root.clone() };
        provisioner.teardown(&ws);
        assert!(!root.exists());
        // Second teardown is a no-op.
        provisioner.teardown(&ws);
    }
}
