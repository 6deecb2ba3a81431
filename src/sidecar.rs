//! Side-car supervision: an optional long-running auxiliary process a task's
//! submission is expected to interact with (e.g. a mock HTTP service).
//!
//! The side-car runs under the host interpreter (not the workspace venv) with
//! its working directory set to its own script directory so relative paths
//! resolve. stderr is merged into stdout at the shell level so one forwarder
//! thread carries the whole stream.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use wait_timeout::ChildExt;

use crate::task::Task;
use crate::workspace::host_python;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// A live side-car process with its log-forwarding worker.
pub struct SideCarHandle {
    child: std::process::Child,
    pump: Option<JoinHandle<()>>,
    pub script: PathBuf,
    /// When the process was spawned; the orchestrator's wait gate measures
    /// warm-up time from here.
    pub started_at: Instant,
}

impl SideCarHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for SideCarHandle {
    fn drop(&mut self) {
        // Backstop only; the supervisor's stop() is the normal teardown path.
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

/// Starts and stops side-car processes for tasks that declare one.
pub struct SideCarSupervisor {
    assets_root: PathBuf,
}

impl SideCarSupervisor {
    pub fn new(assets_root: PathBuf) -> Self {
        SideCarSupervisor { assets_root }
    }

    /// Start the task's side-car, if any. A declared-but-missing script is
    /// logged and skipped so the task can still run to a graded failure.
    pub fn start(&self, task: &Task) -> Result<Option<SideCarHandle>> {
        let Some(rel) = &task.side_car_script else {
            return Ok(None);
        };
        let script = self.assets_root.join(rel.trim_matches('/'));
        if !script.is_file() {
            warn!(script = %script.display(), "side-car script does not exist");
            return Ok(None);
        }
        let script_dir = script
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.assets_root.clone());

        let quoted = shlex::try_quote(&script.display().to_string())
            .context("quote side-car script path")?
            .into_owned();
        let shell_line = format!("exec {} {} 2>&1", host_python(), quoted);

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&shell_line)
            .current_dir(&script_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        // Own process group so stop() can take down any children it forked.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn side-car {}", script.display()))?;

        let started_at = Instant::now();
        info!(task_id = %task.id, pid = child.id(), script = %script.display(), "side-car started");

        let stdout = child.stdout.take().expect("side-car stdout piped");
        let pump = std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if !line.trim().is_empty() {
                            info!("side-car: {line}");
                        }
                    }
                    Err(err) => {
                        error!(%err, "error streaming side-car output");
                        break;
                    }
                }
            }
        });

        Ok(Some(SideCarHandle {
            child,
            pump: Some(pump),
            script,
            started_at,
        }))
    }

    /// Terminate the side-car: SIGTERM, wait up to 5 s, then SIGKILL.
    pub fn stop(&self, mut handle: SideCarHandle) {
        let pid = handle.pid();
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                info!(pid, ?status, "side-car already exited");
            }
            _ => {
                info!(pid, "terminating side-car");
                #[cfg(unix)]
                crate::exec::send_signal_group(pid, libc::SIGTERM);
                #[cfg(not(unix))]
                let _ = handle.child.kill();

                match handle.child.wait_timeout(STOP_GRACE) {
                    Ok(Some(status)) => info!(pid, ?status, "side-car terminated"),
                    Ok(None) => {
                        warn!(pid, "side-car ignored terminate, force killing");
                        #[cfg(unix)]
                        crate::exec::send_signal_group(pid, libc::SIGKILL);
                        let _ = handle.child.kill();
                        let _ = handle.child.wait();
                    }
                    Err(err) => warn!(pid, %err, "error waiting for side-car"),
                }
            }
        }
        if let Some(pump) = handle.pump.take() {
            let _ = pump.join();
        }
    }
}

// ---------- Unit tests ----------
