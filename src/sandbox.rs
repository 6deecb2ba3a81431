//! The agent's sandboxed shell environment.
//!
//! Every action the agent proposes runs as one `bash -c` invocation inside
//! the agent workspace, with stderr folded into stdout and `PATH` pointing at
//! the workspace venv so `python`/`pip` resolve to the isolated interpreter.
//! A tracking wrapper records `(command, exit_code)` pairs so the backend can
//! later reconstruct which OS packages the agent actually installed.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::exec::{ExecOpts, ProcessExecutor};
use crate::task::AgentEnvSpec;
use crate::workspace::Workspace;

/// Default per-command budget inside the sandbox.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Output of one sandboxed command, stderr merged into stdout.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Shell execution scoped to an agent workspace.
pub struct SandboxEnv {
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout_secs: u64,
    pub(crate) executor: ProcessExecutor,
}

impl SandboxEnv {
    /// Sandbox rooted at the workspace, with the venv first on `PATH` and
    /// `VIRTUAL_ENV` set, mirroring an activated environment.
    pub fn for_workspace(workspace: &Workspace, timeout_secs: u64, executor: ProcessExecutor) -> Self {
        let venv_bin = workspace.venv_bin();
        let inherited_path = std::env::var("PATH").unwrap_or_default();
        let path = if inherited_path.is_empty() {
            venv_bin.display().to_string()
        } else {
            format!("{}:{inherited_path}", venv_bin.display())
        };
        SandboxEnv {
            cwd: workspace.root.clone(),
            env: vec![
                ("PATH".to_string(), path),
                ("VIRTUAL_ENV".to_string(), workspace.venv.display().to_string()),
            ],
            timeout_secs,
            executor,
        }
    }

    /// Run one shell command. `exec 2>&1` up front merges the streams the
    /// way an interactive shell transcript would read.
    pub fn execute(&self, command: &str) -> CommandOutput {
        let script = format!("exec 2>&1\n{command}");
        let mut opts = ExecOpts::new(
            vec!["bash".to_string(), "-c".to_string(), script],
            Duration::from_secs(self.timeout_secs),
            "sandbox",
        )
        .cwd(&self.cwd);
        for (key, value) in &self.env {
            opts = opts.env(key.clone(), value.clone());
        }

        let result = self.executor.execute(opts);
        CommandOutput {
            output: result.stdout,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
        }
    }

    /// Public fields exposed to the agent's prompt templates.
    pub fn template_vars(&self) -> serde_json::Map<String, Value> {
        let mut vars = serde_json::Map::new();
        vars.insert("cwd".to_string(), json!(self.cwd.display().to_string()));
        vars.insert("timeout".to_string(), json!(self.timeout_secs));
        vars.insert("system".to_string(), json!(std::env::consts::OS));
        vars
    }
}

/// Records every command the sandbox executes, successful or not.
pub struct TrackedEnv {
    inner: SandboxEnv,
    pub commands: Vec<(String, Option<i32>)>,
}

impl TrackedEnv {
    pub fn new(inner: SandboxEnv) -> Self {
        TrackedEnv { inner, commands: Vec::new() }
    }

    pub fn execute(&mut self, command: &str) -> CommandOutput {
        let output = self.inner.execute(command);
        self.commands.push((command.to_string(), output.exit_code));
        output
    }

    pub fn sandbox(&self) -> &SandboxEnv {
        &self.inner
    }
}

/// Copy the task's declared agent assets into the sandbox workspace.
///
/// Each entry is validated before copying: it must resolve inside the asset
/// root (no `..` escapes), must exist, and must match the declared type.
/// Violations are logged and skipped, never fatal. Returns the
/// workspace-relative paths actually seeded, for the prompt templates.
pub fn preseed_agent_assets(
    spec: &AgentEnvSpec,
    asset_root: &Path,
    workspace_root: &Path,
) -> Vec<String> {
    let Ok(canonical_root) = asset_root.canonicalize() else {
        warn!(asset_root = %asset_root.display(), "agent asset root does not exist");
        return Vec::new();
    };

    let mut seeded = Vec::new();
    for rel in &spec.files {
        if let Some(path) = validate_asset(&canonical_root, rel, false) {
            let destination = workspace_root.join(rel.trim_matches('/'));
            if let Some(parent) = destination.parent() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    warn!(%err, "could not create parent for agent asset");
                    continue;
                }
            }
            match std::fs::copy(&path, &destination) {
                Ok(_) => {
                    info!(asset = %rel, "agent file seeded");
                    seeded.push(rel.trim_matches('/').to_string());
                }
                Err(err) => warn!(asset = %rel, %err, "agent file copy failed"),
            }
        }
    }
    for rel in &spec.folders {
        if let Some(path) = validate_asset(&canonical_root, rel, true) {
            let destination = workspace_root.join(rel.trim_matches('/'));
            match copy_tree(&path, &destination) {
                Ok(()) => {
                    info!(asset = %rel, "agent folder seeded");
                    seeded.push(rel.trim_matches('/').to_string());
                }
                Err(err) => warn!(asset = %rel, %err, "agent folder copy failed"),
            }
        }
    }
    seeded
}

/// Resolve an asset path and check containment, existence, and type.
fn validate_asset(canonical_root: &Path, rel: &str, expect_dir: bool) -> Option<PathBuf> {
    let candidate = canonical_root.join(rel.trim_matches('/'));
    let resolved = match candidate.canonicalize() {
        Ok(path) => path,
        Err(_) => {
            warn!(asset = %rel, "agent asset does not exist, skipping");
            return None;
        }
    };
    if !resolved.starts_with(canonical_root) {
        warn!(asset = %rel, "agent asset escapes the asset root, skipping");
        return None;
    }
    if expect_dir != resolved.is_dir() {
        warn!(asset = %rel, expected_dir = expect_dir, "agent asset has wrong type, skipping");
        return None;
    }
    Some(resolved)
}

fn copy_tree(source: &Path, destination: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_sandbox(cwd: &Path, timeout_secs: u64) -> SandboxEnv {
        SandboxEnv {
            cwd: cwd.to_path_buf(),
            env: vec![("SANDBOX_PROBE".to_string(), "yes".to_string())],
            timeout_secs,
            executor: ProcessExecutor::new(),
        }
    }

    #[test]
    #[cfg(unix)]
    fn merges_stderr_into_stdout_in_stream_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sandbox = bare_sandbox(tmp.path(), 10);
        let out = sandbox.execute("echo one; echo two >&2; echo three");
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.output.lines().collect::<Vec<_>>(), vec!["one", "two", "three"]);
    }

    #[test]
    #[cfg(unix)]
    fn runs_in_the_workspace_with_injected_env() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sandbox = bare_sandbox(tmp.path(), 10);
        let out = sandbox.execute("pwd; printf '%s\\n' \"$SANDBOX_PROBE\"");
        assert!(out.output.contains("yes"));
    }

    #[test]
    #[cfg(unix)]
    fn command_timeout_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sandbox = bare_sandbox(tmp.path(), 1);
        let out = sandbox.execute("sleep 20");
        assert!(out.timed_out);
    }

    #[test]
    #[cfg(unix)]
    fn tracked_env_records_every_command_with_exit_code() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut tracked = TrackedEnv::new(bare_sandbox(tmp.path(), 10));
        tracked.execute("true");
        tracked.execute("false");
        assert_eq!(tracked.commands.len(), 2);
        assert_eq!(tracked.commands[0].1, Some(0));
        assert_eq!(tracked.commands[1].1, Some(1));
    }

    #[test]
    fn preseed_copies_valid_assets_and_skips_the_rest() {
        let outer = tempfile::tempdir().expect("outer");
        let assets = outer.path().join("assets");
        let data = assets.join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("seed.csv"), "a,b\n").unwrap();
        // Exists, but outside the asset root.
        std::fs::write(outer.path().join("escape.txt"), "secret").unwrap();

        let ws = tempfile::tempdir().expect("workspace");
        let spec = AgentEnvSpec {
            files: vec![
                "data/seed.csv".to_string(),
                "data/missing.csv".to_string(),
                "../escape.txt".to_string(),
                // Declared as file but is a folder: type mismatch.
                "data".to_string(),
            ],
            folders: vec!["data".to_string()],
        };
        let seeded = preseed_agent_assets(&spec, &assets, ws.path());

        assert!(ws.path().join("data").join("seed.csv").is_file());
        assert!(!ws.path().join("escape.txt").exists());
        assert_eq!(seeded, vec!["data/seed.csv".to_string(), "data".to_string()]);
    }
}
