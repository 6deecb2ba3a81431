//! Inference backends: everything that turns a task into a [`Submission`].
//!
//! Two families share the [`InferenceBackend`] contract: a single-shot chat
//! completion (here) and the multi-turn agent loop (`agent` module).

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::{json, Value};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::extract::SubmissionExtractor;
use crate::failure::TaskFailure;
use crate::model::{ChatMessage, ChatModel};
use crate::task::Task;

/// Artifacts produced by an inference backend.
#[derive(Debug, Clone)]
pub struct Submission {
    pub os_packages: Vec<String>,
    pub interpreter_packages: Vec<String>,
    pub script_body: String,
    /// Raw model output or agent payload, for the run log.
    pub raw_transcript: Option<String>,
    pub backend_metadata: Value,
}

/// Which backend drives inference for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    SingleShot,
    Agent,
    AgentIterative,
}

impl BackendKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "single-shot" | "openai" => Ok(BackendKind::SingleShot),
            "agent" => Ok(BackendKind::Agent),
            "agent-iter" | "agent-iterative" => Ok(BackendKind::AgentIterative),
            other => anyhow::bail!(
                "unknown inference backend '{other}' (expected single-shot, agent, or agent-iter)"
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::SingleShot => "single-shot",
            BackendKind::Agent => "agent",
            BackendKind::AgentIterative => "agent-iter",
        }
    }
}

/// Contract every inference backend satisfies.
pub trait InferenceBackend {
    fn name(&self) -> &'static str;

    /// Agent-variant backends run shell commands in their own sandbox, so
    /// the orchestrator defers the side-car start until their loop is done.
    fn defers_side_car(&self) -> bool {
        false
    }

    /// Produce a submission for the task. `diagnostic_dir` receives
    /// backend-specific artifacts (trajectories, failed transcripts).
    fn produce(&mut self, task: &Task, diagnostic_dir: &Path) -> Result<Submission>;
}

// ---------- Single-shot backend ----------

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// One prompt, one completion, three fenced blocks.
pub struct SingleShotBackend {
    model: Box<dyn ChatModel>,
    extractor: SubmissionExtractor,
    max_retries: u32,
    base_delay: Duration,
}

impl SingleShotBackend {
    pub fn new(model: Box<dyn ChatModel>) -> Self {
        SingleShotBackend {
            model,
            extractor: SubmissionExtractor::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    /// Call the model with exponential backoff plus jitter.
    fn prompt_with_retry(&mut self, prompt: &str) -> Result<(String, f64, u32)> {
        let messages = [ChatMessage::user(prompt)];
        let mut attempt = 0;
        loop {
            let start = Instant::now();
            match self.model.query(&messages) {
                Ok(response) => {
                    let duration = start.elapsed().as_secs_f64();
                    info!(duration_seconds = duration, attempt = attempt + 1, "model response received");
                    return Ok((response.content, duration, attempt));
                }
                Err(err) if attempt < self.max_retries => {
                    let backoff = self.base_delay.as_secs_f64() * f64::from(1u32 << attempt);
                    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                    let delay = Duration::from_secs_f64(backoff + jitter);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_seconds = delay.as_secs_f64(),
                        %err,
                        "model call failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "model call failed after {} attempts",
                        self.max_retries + 1
                    )));
                }
            }
        }
    }

    fn build_prompt(task: &Task) -> String {
        format!(
            r#"You are tasked with solving a programming problem. Please provide:

1. System package installation commands if needed (in a ```bash code block with apt-get)
2. A pip install command with required Python packages (in a ```bash code block with pip install)
3. A complete Python script to solve the problem (in a ```python code block)

Problem Description:
{description}

Please ensure your script can be run with "python script.py" and produces the exact output format specified.

Your response should contain (as needed):
```bash
# System packages (if needed)
sudo apt-get update && sudo apt-get install -y package1 package2
```

```bash
# Python packages
pip install package1 package2 package3
```

```python
# Your complete Python script here
```
"#,
            description = task.description
        )
    }
}

impl InferenceBackend for SingleShotBackend {
    fn name(&self) -> &'static str {
        "single-shot"
    }

    fn produce(&mut self, task: &Task, _diagnostic_dir: &Path) -> Result<Submission> {
        let prompt = Self::build_prompt(task);
        info!(task_id = %task.id, model = %self.model.model_name(), "prompting model");

        let (response, duration_seconds, retry_attempt) = self.prompt_with_retry(&prompt)?;

        let interpreter_packages = self.extractor.extract_interpreter_packages(&response);
        let os_packages = self.extractor.extract_os_packages(&response);
        let script_body = self
            .extractor
            .extract_script(&response)
            .ok_or(TaskFailure::SubmissionAbsent)
            .context("single-shot response had no python block")?;

        let metadata = json!({
            "model": self.model.model_name(),
            "duration_seconds": duration_seconds,
            "retry_attempt": retry_attempt,
            "n_calls": self.model.n_calls(),
            "cost": self.model.cost(),
            "pip_packages_found": interpreter_packages,
            "apt_packages_found": os_packages,
            "script_length": script_body.len(),
        });

        Ok(Submission {
            os_packages,
            interpreter_packages,
            script_body,
            raw_transcript: Some(response),
            backend_metadata: metadata,
        })
    }
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::categorize;
    use crate::model::ScriptedModel;
    use crate::task::{ResultSpec, TaskInputs};
    use std::path::PathBuf;

    fn sample_task() -> Task {
        Task {
            id: "sample".to_string(),
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
            result: ResultSpec::Numerical { expected: 42.0 },
            agent_env: None,
            spec_path: PathBuf::from("sample.yaml"),
        }
    }

    #[test]
    fn produces_submission_from_well_formed_response() {
        let response = "```bash\nsudo apt-get install -y jq\n```\n\
                        ```bash\npip install requests\n```\n\
                        ```python\nprint('ANSWER=42')\n```\n";
        let model = ScriptedModel::new(vec![response.to_string()]);
        let mut backend = SingleShotBackend::new(Box::new(model));

        let submission = backend
            .produce(&sample_task(), Path::new("/tmp"))
            .expect("submission");
        assert_eq!(submission.script_body, "print('ANSWER=42')");
        assert_eq!(submission.os_packages, vec!["jq"]);
        assert_eq!(submission.interpreter_packages, vec!["requests"]);
        assert!(submission.raw_transcript.is_some());
    }

    #[test]
    fn missing_script_block_is_submission_absent() {
        let model = ScriptedModel::new(vec!["no code at all".to_string()]);
        let mut backend = SingleShotBackend::new(Box::new(model));
        let err = backend.produce(&sample_task(), Path::new("/tmp")).unwrap_err();
        assert_eq!(categorize(&err), "submission-absent");
    }

    #[test]
    fn retries_then_fails_when_model_keeps_erroring() {
        // An exhausted scripted model errors on every call.
        let model = ScriptedModel::new(vec![]);
        let mut backend = SingleShotBackend::new(Box::new(model))
            .with_retry(1, Duration::from_millis(1));
        let err = backend.produce(&sample_task(), Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"), "{err:#}");
    }

    #[test]
    fn prompt_embeds_the_task_description() {
        let prompt = SingleShotBackend::build_prompt(&sample_task());
        assert!(prompt.contains("Print the answer."));
        assert!(prompt.contains("```python"));
    }

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!(BackendKind::parse("openai").unwrap(), BackendKind::SingleShot);
        assert_eq!(BackendKind::parse("agent").unwrap(), BackendKind::Agent);
        assert_eq!(
            BackendKind::parse("agent-iterative").unwrap(),
            BackendKind::AgentIterative
        );
        assert!(BackendKind::parse("quantum").is_err());
    }
}
