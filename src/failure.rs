//! Task-level failure taxonomy.
//!
//! Every category is fatal to the task and harmless to the run: the
//! orchestrator catches anything a subcomponent raises at the task boundary
//! and records it on the result. Uncategorised errors become `Unexpected`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("no script block found in inference output")]
    SubmissionAbsent,

    #[error("script execution failed: {stderr}")]
    ExecutionFailed { stderr: String },

    #[error("script execution timed out after {timeout_secs}s")]
    ExecutionTimedOut { timeout_secs: u64 },

    #[error("agent exhausted its limits: {0}")]
    AgentLimit(String),

    #[error("agent submission path invalid: {0}")]
    InvalidPath(String),

    #[error("environment setup failed: {0}")]
    SetupError(String),
}

impl TaskFailure {
    /// Stable category label recorded in task results.
    pub fn category(&self) -> &'static str {
        match self {
            TaskFailure::SubmissionAbsent => "submission-absent",
            TaskFailure::ExecutionFailed { .. } => "execution-failed",
            TaskFailure::ExecutionTimedOut { .. } => "execution-timed-out",
            TaskFailure::AgentLimit(_) => "agent-limit",
            TaskFailure::InvalidPath(_) => "invalid-path",
            TaskFailure::SetupError(_) => "setup-error",
        }
    }
}

/// Category for an arbitrary error crossing the task boundary.
pub fn categorize(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<TaskFailure>()
        .map(TaskFailure::category)
        .unwrap_or("unexpected")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_failures_keep_their_category_through_anyhow() {
        let err = anyhow::Error::from(TaskFailure::SubmissionAbsent);
        assert_eq!(categorize(&err), "submission-absent");

        let err = anyhow::Error::from(TaskFailure::ExecutionTimedOut { timeout_secs: 60 });
        assert_eq!(categorize(&err), "execution-timed-out");
    }

    #[test]
    fn other_errors_are_unexpected() {
        let err = anyhow::anyhow!("disk exploded");
        assert_eq!(categorize(&err), "unexpected");
    }
}
