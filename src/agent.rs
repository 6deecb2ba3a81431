//! Multi-turn agent backend: a bounded protocol between a model and a
//! sandboxed workspace.
//!
//! The model proposes exactly one shell command per turn; the sandbox
//! executes it and the output comes back as an observation. A completion
//! sentinel on the first output line ends the loop, and the remainder of
//! that output names the workspace-relative path of the submitted script.
//! The iterative variant additionally refuses submissions before a minimum
//! number of steps.

use anyhow::{Context, Result};
use minijinja::UndefinedBehavior;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{InferenceBackend, Submission};
use crate::exec::{ExecOpts, ProcessExecutor};
use crate::extract::os_packages_in_command;
use crate::failure::TaskFailure;
use crate::model::{ChatMessage, ChatModel};
use crate::sandbox::{preseed_agent_assets, SandboxEnv, TrackedEnv, DEFAULT_COMMAND_TIMEOUT_SECS};
use crate::task::Task;
use crate::workspace::{Workspace, WorkspaceProvisioner};

/// First-line tokens that signal the agent's final payload.
pub const COMPLETION_SENTINELS: [&str; 3] = [
    "MINI_SWE_AGENT_FINAL_OUTPUT",
    "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT",
    "END",
];

/// Packages present in every fresh venv; never reported as agent installs.
const BOOTSTRAP_PACKAGES: [&str; 3] = ["pip", "setuptools", "wheel"];

/// Default minimum step count for the iterative variant.
const DEFAULT_MINIMUM_ITERATIONS: u32 = 5;

/// Prompt templates and budgets for the agent loop. Loaded from a YAML file;
/// every field has a default so a partial file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_template: String,
    pub instance_template: String,
    pub timeout_template: String,
    pub format_error_template: String,
    pub action_observation_template: String,
    pub early_submission_template: String,
    /// Maximum executed actions; 0 disables the limit.
    pub step_limit: u32,
    /// Maximum accumulated model cost; 0 disables the limit.
    pub cost_limit: f64,
    /// Steps required before a submission is accepted (iterative variant).
    pub minimum_iterations: u32,
    /// Per-command budget inside the sandbox.
    pub command_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            system_template: "You are an autonomous programmer working inside a sandboxed \
                              workspace at {{ cwd }}. In each turn, reply with exactly one \
                              shell command in a ```bash fenced block."
                .to_string(),
            instance_template: "Your task: {{ task }}\n\n\
                The task result kind is {{ result_type }}. Work inside the workspace; \
                `python` and `pip` resolve to an isolated interpreter.\n\
                Write your final solution script to a file in the workspace. When you are \
                done, run a command whose first output line is \
                COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT followed by the workspace-relative \
                path of that script on the next line, for example:\n\
                printf 'COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\\nsolution.py\\n'\n\
                Reply with exactly one shell command in triple backticks each turn. Each \
                command is killed after {{ timeout }} seconds."
                .to_string(),
            timeout_template: "The last command <command>{{ action }}</command> timed out \
                and has been killed.\nThe output of the command was:\n<output>\n{{ output }}\n\
                </output>\nPlease try another command and make sure to avoid those requiring \
                interactive input."
                .to_string(),
            format_error_template: "Please always provide EXACTLY ONE action in triple backticks."
                .to_string(),
            action_observation_template: "Observation: {{ output }}".to_string(),
            early_submission_template: "You attempted to finish on step {{ current_step }}, \
                but you must complete at least {{ minimum_steps }} steps. \
                {{ steps_remaining }} more step(s) are required before you may emit the \
                completion signal."
                .to_string(),
            step_limit: 0,
            cost_limit: 3.0,
            minimum_iterations: 0,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read agent config {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("parse agent config {}", path.display()))
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentExit {
    Submitted,
    LimitsExceeded,
}

/// Result of one loop run: exit status, final payload, full transcript.
pub struct AgentOutcome {
    pub status: AgentExit,
    pub payload: String,
    pub messages: Vec<ChatMessage>,
    pub steps: u32,
}

/// The loop itself, generic over model and tracked sandbox so tests can drive
/// it with a scripted model.
pub struct AgentLoop<'a> {
    config: &'a AgentConfig,
    model: &'a mut dyn ChatModel,
    env: &'a mut TrackedEnv,
    iterative: bool,
    extra_vars: Map<String, Value>,
    action_block: Regex,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        config: &'a AgentConfig,
        model: &'a mut dyn ChatModel,
        env: &'a mut TrackedEnv,
        iterative: bool,
        task_vars: Map<String, Value>,
    ) -> Self {
        AgentLoop {
            config,
            model,
            env,
            iterative,
            extra_vars: task_vars,
            action_block: Regex::new(r"(?s)```bash\s*\n(.*?)\n```").expect("action regex"),
        }
    }

    /// Drive the protocol until submission or limit exhaustion.
    pub fn run(&mut self) -> Result<AgentOutcome> {
        let mut messages = vec![
            ChatMessage::system(self.render(&self.config.system_template, Map::new())?),
        ];
        self.set_iteration_vars(0);
        messages.push(ChatMessage::user(self.render(&self.config.instance_template, Map::new())?));

        // Counts executed actions only; format errors do not advance it.
        let mut steps: u32 = 0;

        loop {
            if self.limits_hit(steps) {
                let note = format!(
                    "limits exceeded after {steps} step(s), {} model call(s), cost {:.4}",
                    self.model.n_calls(),
                    self.model.cost()
                );
                warn!(steps, "agent loop terminating: {note}");
                messages.push(ChatMessage::user(note.clone()));
                return Ok(AgentOutcome {
                    status: AgentExit::LimitsExceeded,
                    payload: note,
                    messages: std::mem::take(&mut messages),
                    steps,
                });
            }

            self.set_iteration_vars(steps + 1);
            let response = self.model.query(&messages)?;
            messages.push(ChatMessage::assistant(response.content.clone()));

            let actions: Vec<String> = self
                .action_block
                .captures_iter(&response.content)
                .map(|c| c[1].trim().to_string())
                .collect();
            if actions.len() != 1 {
                info!(n_blocks = actions.len(), "format error: expected exactly one bash block");
                messages.push(ChatMessage::user(
                    self.render(&self.config.format_error_template, Map::new())?,
                ));
                continue;
            }
            let action = &actions[0];

            let output = self.env.execute(action);
            steps += 1;
            self.set_iteration_vars(steps);

            if output.timed_out {
                let mut kwargs = Map::new();
                kwargs.insert("action".to_string(), json!(action));
                kwargs.insert("output".to_string(), json!(output.output));
                messages.push(ChatMessage::user(self.render(&self.config.timeout_template, kwargs)?));
                continue;
            }

            if let Some(payload) = sentinel_payload(&output.output) {
                if self.iterative && steps < self.config.minimum_iterations {
                    info!(steps, minimum = self.config.minimum_iterations, "early submission rejected");
                    let mut kwargs = Map::new();
                    kwargs.insert("submitted_output".to_string(), json!(payload));
                    messages.push(ChatMessage::user(
                        self.render(&self.config.early_submission_template, kwargs)?,
                    ));
                    continue;
                }
                info!(steps, "agent submitted");
                messages.push(ChatMessage::user(payload.clone()));
                return Ok(AgentOutcome {
                    status: AgentExit::Submitted,
                    payload,
                    messages: std::mem::take(&mut messages),
                    steps,
                });
            }

            let mut kwargs = Map::new();
            kwargs.insert("output".to_string(), json!(output.output));
            messages.push(ChatMessage::user(
                self.render(&self.config.action_observation_template, kwargs)?,
            ));
        }
    }

    fn limits_hit(&self, steps: u32) -> bool {
        (self.config.step_limit > 0 && steps >= self.config.step_limit)
            || (self.config.cost_limit > 0.0 && self.model.cost() >= self.config.cost_limit)
    }

    fn set_iteration_vars(&mut self, current_step: u32) {
        if !self.iterative {
            return;
        }
        let minimum = self.config.minimum_iterations;
        self.extra_vars.insert("minimum_steps".to_string(), json!(minimum));
        self.extra_vars.insert("current_step".to_string(), json!(current_step));
        self.extra_vars
            .insert("steps_remaining".to_string(), json!(minimum.saturating_sub(current_step)));
        self.extra_vars.insert("next_step".to_string(), json!(current_step + 1));
    }

    /// Render a template against the merged variable space: agent config,
    /// sandbox environment, model wrapper, per-task extras, call kwargs.
    fn render(&self, template: &str, kwargs: Map<String, Value>) -> Result<String> {
        let mut context = Map::new();
        if let Ok(Value::Object(config_vars)) = serde_json::to_value(self.config) {
            context.extend(config_vars);
        }
        context.extend(self.env.sandbox().template_vars());
        context.extend(self.model.template_vars());
        context.extend(self.extra_vars.clone());
        context.extend(kwargs);

        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.render_str(template, &context).context("render agent template")
    }
}

/// If the first non-blank line is a completion sentinel, return the rest of
/// the output (the submission payload).
pub fn sentinel_payload(output: &str) -> Option<String> {
    let trimmed = output.trim_start();
    let mut lines = trimmed.lines();
    let first = lines.next()?.trim().to_uppercase();
    if COMPLETION_SENTINELS.contains(&first.as_str()) {
        let rest: Vec<&str> = lines.collect();
        Some(rest.join("\n"))
    } else {
        None
    }
}

// ---------- The backend ----------

/// Inference backend wrapping the agent loop in its own sandbox workspace.
pub struct AgentBackend {
    model: Box<dyn ChatModel>,
    config: AgentConfig,
    iterative: bool,
    provisioner: WorkspaceProvisioner,
    agent_assets_root: PathBuf,
    executor: ProcessExecutor,
}

impl AgentBackend {
    pub fn new(
        model: Box<dyn ChatModel>,
        mut config: AgentConfig,
        iterative: bool,
        agent_assets_root: PathBuf,
        executor: ProcessExecutor,
    ) -> Self {
        if iterative && config.minimum_iterations == 0 {
            config.minimum_iterations = DEFAULT_MINIMUM_ITERATIONS;
        }
        AgentBackend {
            model,
            config,
            iterative,
            provisioner: WorkspaceProvisioner::new(agent_assets_root.clone(), executor.clone()),
            agent_assets_root,
            executor,
        }
    }

    fn template_vars_for(&self, task: &Task, workspace: &Workspace, seeded: &[String]) -> Map<String, Value> {
        let mut vars = Map::new();
        vars.insert("task".to_string(), json!(task.description));
        vars.insert("difficulty".to_string(), json!(task.difficulty));
        vars.insert("result_type".to_string(), json!(task.result.kind()));
        vars.insert("expected_result".to_string(), serde_json::to_value(&task.result).unwrap_or(Value::Null));
        vars.insert("workspace".to_string(), json!(workspace.root.display().to_string()));
        vars.insert("venv".to_string(), json!(workspace.venv.display().to_string()));
        vars.insert("seeded_assets".to_string(), json!(seeded));
        vars
    }

    /// `pip list --format=freeze`, normalised package names.
    fn pip_snapshot(&self, workspace: &Workspace) -> BTreeSet<String> {
        let result = self.executor.execute(
            ExecOpts::new(
                vec![
                    workspace.pip_path().display().to_string(),
                    "list".to_string(),
                    "--format=freeze".to_string(),
                ],
                Duration::from_secs(60),
                "pip-snapshot",
            )
            .cwd(&workspace.root),
        );
        if !result.success() {
            warn!(exit_code = ?result.exit_code, "pip snapshot failed");
            return BTreeSet::new();
        }
        result
            .stdout
            .lines()
            .filter(|line| !line.starts_with('-'))
            .filter_map(|line| line.split("==").next())
            .map(normalize_package_name)
            .filter(|name| !name.is_empty())
            .collect()
    }

    fn persist_trajectory(
        &self,
        diagnostic_dir: &Path,
        task: &Task,
        messages: &[ChatMessage],
        exit_status: Option<AgentExit>,
        payload: Option<&str>,
    ) {
        let data = json!({
            "info": {
                "exit_status": exit_status,
                "submission": payload,
                "model_stats": {
                    "instance_cost": self.model.cost(),
                    "api_calls": self.model.n_calls(),
                },
                "config": {
                    "agent": &self.config,
                    "iterative": self.iterative,
                    "model": self.model.model_name(),
                },
            },
            "messages": messages,
            "trajectory_format": "scriptbench-agent-1",
        });
        let path = diagnostic_dir.join(format!("{}.traj.json", task.id));
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&data).map(|text| std::fs::write(&path, text)) {
            Ok(Ok(())) => info!(path = %path.display(), "trajectory saved"),
            Ok(Err(err)) => warn!(%err, "failed to save trajectory"),
            Err(err) => warn!(%err, "failed to serialize trajectory"),
        }
    }
}

impl InferenceBackend for AgentBackend {
    fn name(&self) -> &'static str {
        if self.iterative { "agent-iter" } else { "agent" }
    }

    fn defers_side_car(&self) -> bool {
        true
    }

    fn produce(&mut self, task: &Task, diagnostic_dir: &Path) -> Result<Submission> {
        let workspace = self
            .provisioner
            .provision_bare(&format!("{}_agent", task.id))
            .map_err(|err| TaskFailure::SetupError(format!("agent sandbox: {err:#}")))?;

        let outcome = self.run_in_workspace(task, diagnostic_dir, &workspace);
        // The sandbox is read back into memory before this point; nothing
        // below needs the directory.
        self.provisioner.teardown(&workspace);
        outcome
    }
}

impl AgentBackend {
    fn run_in_workspace(
        &mut self,
        task: &Task,
        diagnostic_dir: &Path,
        workspace: &Workspace,
    ) -> Result<Submission> {
        let seeded = match &task.agent_env {
            Some(spec) => preseed_agent_assets(spec, &self.agent_assets_root, &workspace.root),
            None => Vec::new(),
        };

        let packages_before = self.pip_snapshot(workspace);

        let sandbox = SandboxEnv::for_workspace(
            workspace,
            self.config.command_timeout_secs,
            self.executor.clone(),
        );
        let mut tracked = TrackedEnv::new(sandbox);
        let task_vars = self.template_vars_for(task, workspace, &seeded);

        info!(task_id = %task.id, workspace = %workspace.root.display(), iterative = self.iterative, "starting agent loop");
        let outcome = {
            let mut agent_loop = AgentLoop::new(
                &self.config,
                self.model.as_mut(),
                &mut tracked,
                self.iterative,
                task_vars,
            );
            agent_loop.run()?
        };

        self.persist_trajectory(
            diagnostic_dir,
            task,
            &outcome.messages,
            Some(outcome.status),
            Some(&outcome.payload),
        );

        if outcome.status == AgentExit::LimitsExceeded {
            return Err(TaskFailure::AgentLimit(outcome.payload).into());
        }

        let script_rel = first_payload_line(&outcome.payload)
            .ok_or_else(|| TaskFailure::InvalidPath("empty submission payload".to_string()))?;
        let script_body = read_workspace_script(&workspace.root, &script_rel)?;

        let packages_after = self.pip_snapshot(workspace);
        let interpreter_packages: Vec<String> = packages_after
            .difference(&packages_before)
            .filter(|name| !BOOTSTRAP_PACKAGES.contains(&name.as_str()))
            .cloned()
            .collect();

        let mut os_packages: Vec<String> = Vec::new();
        for (command, exit_code) in &tracked.commands {
            if *exit_code == Some(0) {
                for pkg in os_packages_in_command(command) {
                    if !os_packages.contains(&pkg) {
                        os_packages.push(pkg);
                    }
                }
            }
        }

        let metadata = json!({
            "agent": {
                "exit_status": outcome.status,
                "steps": outcome.steps,
                "model_calls": self.model.n_calls(),
                "model_cost": self.model.cost(),
                "script_path": script_rel,
                "commands_executed": tracked.commands.len(),
                "seeded_assets": seeded,
            },
        });

        Ok(Submission {
            os_packages,
            interpreter_packages,
            script_body,
            raw_transcript: Some(outcome.payload),
            backend_metadata: metadata,
        })
    }
}

/// First non-blank payload line: the declared script path.
fn first_payload_line(payload: &str) -> Option<String> {
    payload
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Read the submitted script, rejecting absolute paths and workspace escapes.
fn read_workspace_script(workspace_root: &Path, rel: &str) -> Result<String> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(TaskFailure::InvalidPath(format!("absolute path not allowed: {rel}")).into());
    }
    let canonical_root = workspace_root
        .canonicalize()
        .map_err(|err| TaskFailure::InvalidPath(format!("workspace root: {err}")))?;
    let resolved = canonical_root
        .join(rel_path)
        .canonicalize()
        .map_err(|_| TaskFailure::InvalidPath(format!("script path does not exist: {rel}")))?;
    if !resolved.starts_with(&canonical_root) {
        return Err(TaskFailure::InvalidPath(format!("path escapes the workspace: {rel}")).into());
    }
    if !resolved.is_file() {
        return Err(TaskFailure::InvalidPath(format!("not a file: {rel}")).into());
    }
    std::fs::read_to_string(&resolved)
        .map_err(|err| TaskFailure::InvalidPath(format!("unreadable script {rel}: {err}")).into())
}

/// PEP 503-style folding so snapshot diffs are spelling-insensitive.
fn normalize_package_name(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptedModel;

    fn tracked_env(cwd: &Path, timeout_secs: u64) -> TrackedEnv {
        TrackedEnv::new(SandboxEnv {
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
            timeout_secs,
            executor: ProcessExecutor::new(),
        })
    }

    fn bash(cmd: &str) -> String {
        format!("```bash\n{cmd}\n```")
    }

    /// The per-task variables the default templates reference.
    fn task_vars() -> Map<String, Value> {
        let mut vars = Map::new();
        vars.insert("task".to_string(), json!("count the files"));
        vars.insert("result_type".to_string(), json!("numerical"));
        vars
    }

    #[test]
    fn sentinel_detection_is_case_insensitive_and_trims() {
        assert_eq!(
            sentinel_payload("  end  \nsolution.py\n"),
            Some("solution.py".to_string())
        );
        assert_eq!(
            sentinel_payload("COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\na/b.py"),
            Some("a/b.py".to_string())
        );
        assert_eq!(sentinel_payload("nothing to see"), None);
        assert_eq!(sentinel_payload("MINI_SWE_AGENT_FINAL_OUTPUT"), Some(String::new()));
    }

    #[test]
    #[cfg(unix)]
    fn loop_submits_on_sentinel_and_preserves_turn_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut model = ScriptedModel::new(vec![
            bash("echo probing"),
            bash("printf 'COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\\nsolution.py\\n'"),
        ]);
        let mut env = tracked_env(tmp.path(), 10);
        let config = AgentConfig::default();
        let outcome = AgentLoop::new(&config, &mut model, &mut env, false, task_vars())
            .run()
            .expect("outcome");

        assert_eq!(outcome.status, AgentExit::Submitted);
        assert_eq!(outcome.payload.trim(), "solution.py");
        assert_eq!(outcome.steps, 2);

        // system, instance, then strict assistant/user alternation.
        let roles: Vec<&str> = outcome.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles[0], "system");
        assert_eq!(roles[1], "user");
        for pair in roles[2..].chunks(2) {
            assert_eq!(pair[0], "assistant");
            assert_eq!(pair[1], "user");
        }
    }

    #[test]
    #[cfg(unix)]
    fn format_error_appends_correction_without_advancing_steps() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut model = ScriptedModel::new(vec![
            "no action here".to_string(),
            format!("{}\n{}", bash("echo one"), bash("echo two")),
            bash("printf 'END\\nfinal.py\\n'"),
        ]);
        let mut env = tracked_env(tmp.path(), 10);
        let config = AgentConfig::default();
        let outcome = AgentLoop::new(&config, &mut model, &mut env, false, task_vars())
            .run()
            .expect("outcome");

        assert_eq!(outcome.status, AgentExit::Submitted);
        // Only the final sentinel command ran.
        assert_eq!(outcome.steps, 1);
        assert_eq!(env.commands.len(), 1);
        let corrections = outcome
            .messages
            .iter()
            .filter(|m| m.content.contains("EXACTLY ONE action"))
            .count();
        assert_eq!(corrections, 2);
    }

    #[test]
    #[cfg(unix)]
    fn iterative_variant_rejects_early_submission() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut model = ScriptedModel::new(vec![
            bash("printf 'END\\ntoo-early.py\\n'"),
            bash("echo working"),
            bash("printf 'END\\nfinal.py\\n'"),
        ]);
        let mut env = tracked_env(tmp.path(), 10);
        let config = AgentConfig { minimum_iterations: 2, ..AgentConfig::default() };
        let outcome = AgentLoop::new(&config, &mut model, &mut env, true, task_vars())
            .run()
            .expect("outcome");

        assert_eq!(outcome.status, AgentExit::Submitted);
        assert_eq!(outcome.payload.trim(), "final.py");
        assert_eq!(outcome.steps, 3);
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.content.contains("at least 2 steps")));
    }

    #[test]
    #[cfg(unix)]
    fn step_limit_terminates_the_loop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut model = ScriptedModel::new(vec![bash("echo again"); 5]);
        let mut env = tracked_env(tmp.path(), 10);
        let config = AgentConfig { step_limit: 2, cost_limit: 0.0, ..AgentConfig::default() };
        let outcome = AgentLoop::new(&config, &mut model, &mut env, false, task_vars())
            .run()
            .expect("outcome");
        assert_eq!(outcome.status, AgentExit::LimitsExceeded);
        assert_eq!(outcome.steps, 2);
    }

    #[test]
    #[cfg(unix)]
    fn cost_limit_terminates_the_loop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut model =
            ScriptedModel::new(vec![bash("echo spend"); 10]).with_cost_per_call(1.0);
        let mut env = tracked_env(tmp.path(), 10);
        let config = AgentConfig { step_limit: 0, cost_limit: 2.5, ..AgentConfig::default() };
        let outcome = AgentLoop::new(&config, &mut model, &mut env, false, task_vars())
            .run()
            .expect("outcome");
        assert_eq!(outcome.status, AgentExit::LimitsExceeded);
        assert!(model.n_calls() <= 3);
    }

    #[test]
    #[cfg(unix)]
    fn command_timeout_becomes_a_templated_observation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut model = ScriptedModel::new(vec![
            bash("sleep 20"),
            bash("printf 'END\\ndone.py\\n'"),
        ]);
        let mut env = tracked_env(tmp.path(), 1);
        let config = AgentConfig::default();
        let outcome = AgentLoop::new(&config, &mut model, &mut env, false, task_vars())
            .run()
            .expect("outcome");
        assert_eq!(outcome.status, AgentExit::Submitted);
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.content.contains("timed out and has been killed")));
    }

    #[test]
    fn workspace_script_validation_rejects_bad_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("ok.py"), "print('hi')\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();

        let body = read_workspace_script(tmp.path(), "ok.py").expect("read");
        assert_eq!(body, "print('hi')\n");

        let abs = tmp.path().join("ok.py").display().to_string();
        assert!(read_workspace_script(tmp.path(), &abs).is_err());
        assert!(read_workspace_script(tmp.path(), "../outside.py").is_err());
        assert!(read_workspace_script(tmp.path(), "missing.py").is_err());
        assert!(read_workspace_script(tmp.path(), "sub").is_err());
    }

    #[test]
    fn package_names_are_normalised() {
        assert_eq!(normalize_package_name("Flask_SQLAlchemy"), "flask-sqlalchemy");
        assert_eq!(normalize_package_name("  requests "), "requests");
    }

    #[test]
    fn agent_config_round_trips_through_yaml_with_defaults() {
        let partial = "step_limit: 12\ncost_limit: 1.5\n";
        let config: AgentConfig = serde_yaml::from_str(partial).expect("parse");
        assert_eq!(config.step_limit, 12);
        assert!((config.cost_limit - 1.5).abs() < f64::EPSILON);
        // Untouched fields keep their defaults.
        assert!(config.instance_template.contains("COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT"));
        assert_eq!(config.command_timeout_secs, DEFAULT_COMMAND_TIMEOUT_SECS);
    }
}
