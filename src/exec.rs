//! Subprocess execution with real-time output streaming and wall-clock
//! timeouts.
//!
//! This is the single owner of child-process lifecycle in the harness: every
//! other component (installer, side-car teardown, evaluators, the agent
//! sandbox) obtains an [`ExecutionResult`] through [`ProcessExecutor`].
//!
//! Streaming runs on one pump thread per pipe so a child that writes more
//! than a pipe buffer can never deadlock the harness. On unix a watcher
//! thread polls at 100 ms granularity and escalates SIGTERM → grace →
//! SIGKILL at the deadline; elsewhere the main thread falls back to a
//! bounded wait plus kill with the same semantics.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll granularity for the timeout watcher.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a terminated child gets before the forced kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Options for one subprocess execution.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    /// Program and arguments; `argv[0]` is the binary.
    pub argv: Vec<String>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Wall-clock budget measured from spawn.
    pub timeout: Duration,
    /// Prefix identifying this child in streamed log lines.
    pub log_prefix: String,
}

impl ExecOpts {
    pub fn new(argv: Vec<String>, timeout: Duration, log_prefix: impl Into<String>) -> Self {
        ExecOpts {
            argv,
            cwd: None,
            env: Vec::new(),
            timeout,
            log_prefix: log_prefix.into(),
        }
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Outcome of one subprocess execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code; `None` when the child was killed or never spawned.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub timed_out: bool,
    /// Set when the child could not be spawned or waited on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && self.error.is_none()
    }

    fn spawn_failure(err: &std::io::Error, argv: &[String]) -> Self {
        ExecutionResult {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_seconds: 0.0,
            timed_out: false,
            error: Some(format!("failed to spawn {:?}: {err}", argv.first())),
        }
    }
}

/// Executes subprocesses with streaming and timeout enforcement.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        ProcessExecutor
    }

    /// Run a command to completion (or timeout). Spawn failures are reported
    /// inside the result, never as an `Err`, so a missing binary cannot abort
    /// a task.
    pub fn execute(&self, opts: ExecOpts) -> ExecutionResult {
        let Some(program) = opts.argv.first() else {
            return ExecutionResult {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_seconds: 0.0,
                timed_out: false,
                error: Some("empty command".to_string()),
            };
        };

        let mut cmd = Command::new(program);
        cmd.args(&opts.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Children get their own process group so a timeout can take down
        // the whole tree, not just the immediate child.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        if let Some(dir) = &opts.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        debug!(argv = ?opts.argv, timeout_secs = opts.timeout.as_secs(), "spawning child");
        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(argv = ?opts.argv, %err, "spawn failed");
                return ExecutionResult::spawn_failure(&err, &opts.argv);
            }
        };

        let child_stdout = child.stdout.take().expect("child stdout piped");
        let child_stderr = child.stderr.take().expect("child stderr piped");

        let prefix = opts.log_prefix.clone();
        let t_stdout = std::thread::spawn(move || pump_stream(child_stdout, &prefix, StreamKind::Stdout));
        let prefix = opts.log_prefix.clone();
        let t_stderr = std::thread::spawn(move || pump_stream(child_stderr, &prefix, StreamKind::Stderr));

        let (status, timed_out, wait_error) = wait_with_deadline(&mut child, opts.timeout, &opts.log_prefix);

        let stdout_bytes = t_stdout.join().unwrap_or_default();
        let stderr_bytes = t_stderr.join().unwrap_or_default();

        let duration = start.elapsed();
        if timed_out {
            error!(
                prefix = %opts.log_prefix,
                timeout_secs = opts.timeout.as_secs(),
                "execution timed out"
            );
        }

        ExecutionResult {
            exit_code: status.and_then(|s| s.code()),
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            duration_seconds: duration.as_secs_f64(),
            timed_out,
            error: wait_error,
        }
    }
}

enum StreamKind {
    Stdout,
    Stderr,
}

/// Read a child pipe to EOF, forwarding complete lines to the log and
/// retaining the raw bytes. Chunked reads keep partial lines intact until
/// their newline arrives; a trailing partial line is flushed at EOF.
fn pump_stream<R: Read>(mut stream: R, prefix: &str, kind: StreamKind) -> Vec<u8> {
    let mut captured: Vec<u8> = Vec::new();
    let mut line_buf: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                captured.extend_from_slice(chunk);
                for &b in chunk {
                    if b == b'\n' {
                        log_line(prefix, &kind, &String::from_utf8_lossy(&line_buf));
                        line_buf.clear();
                    } else {
                        line_buf.push(b);
                    }
                }
            }
            Err(_) => break,
        }
    }
    if !line_buf.is_empty() {
        log_line(prefix, &kind, &String::from_utf8_lossy(&line_buf));
    }
    captured
}

fn log_line(prefix: &str, kind: &StreamKind, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match kind {
        StreamKind::Stdout => info!("{prefix} stdout: {line}"),
        StreamKind::Stderr => error!("{prefix} stderr: {line}"),
    }
}

/// Wait for the child, enforcing the deadline. Returns the exit status (when
/// one was collected), whether the deadline fired, and any wait error.
#[cfg(unix)]
fn wait_with_deadline(
    child: &mut std::process::Child,
    timeout: Duration,
    prefix: &str,
) -> (Option<std::process::ExitStatus>, bool, Option<String>) {
    let pid = child.id();
    let child_done = Arc::new(AtomicBool::new(false));
    let deadline_fired = Arc::new(AtomicBool::new(false));

    let watcher = {
        let child_done = Arc::clone(&child_done);
        let deadline_fired = Arc::clone(&deadline_fired);
        let prefix = prefix.to_string();
        std::thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            loop {
                std::thread::sleep(POLL_INTERVAL);
                if child_done.load(Ordering::Relaxed) {
                    return;
                }
                if Instant::now() >= deadline {
                    break;
                }
            }
            deadline_fired.store(true, Ordering::Relaxed);
            info!(prefix = %prefix, pid, "deadline reached, sending SIGTERM");
            send_signal_group(pid, libc::SIGTERM);
            let grace_deadline = Instant::now() + KILL_GRACE;
            while Instant::now() < grace_deadline {
                if child_done.load(Ordering::Relaxed) {
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            info!(prefix = %prefix, pid, "grace elapsed, sending SIGKILL");
            send_signal_group(pid, libc::SIGKILL);
        })
    };

    let (status, wait_error) = match child.wait() {
        Ok(status) => (Some(status), None),
        Err(err) => (None, Some(format!("wait failed: {err}"))),
    };
    child_done.store(true, Ordering::Relaxed);
    let _ = watcher.join();

    (status, deadline_fired.load(Ordering::Relaxed), wait_error)
}

/// Fallback for platforms without signal support: bounded wait, then kill.
#[cfg(not(unix))]
fn wait_with_deadline(
    child: &mut std::process::Child,
    timeout: Duration,
    _prefix: &str,
) -> (Option<std::process::ExitStatus>, bool, Option<String>) {
    use wait_timeout::ChildExt;

    match child.wait_timeout(timeout) {
        Ok(Some(status)) => (Some(status), false, None),
        Ok(None) => {
            let _ = child.kill();
            match child.wait_timeout(KILL_GRACE) {
                Ok(Some(status)) => (Some(status), true, None),
                _ => (None, true, None),
            }
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            (None, false, Some(format!("wait failed: {err}")))
        }
    }
}

/// Signal an entire process group rooted at `pid`, tolerating an
/// already-gone target (ESRCH).
#[cfg(unix)]
pub(crate) fn send_signal_group(pid: u32, signum: libc::c_int) {
    // SAFETY: negative pid addresses the process group; see kill(2).
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), signum) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, signum, %err, "group kill failed");
        }
    }
}

// ---------- Unit tests ----------
