//! Package installation into a task workspace.
//!
//! OS packages go through apt (with a dpkg presence check first), interpreter
//! packages through the workspace venv's pip. Packages are installed one at a
//! time and individual failures are recorded, never fatal: the submission may
//! not need the package after all, and when it does the evaluator's failure
//! will carry the real cause.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::exec::{ExecOpts, ProcessExecutor};
use crate::workspace::Workspace;

/// Per-package budget.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Budget for `apt-get update`.
const UPDATE_TIMEOUT: Duration = Duration::from_secs(300);
/// Budget for the dpkg presence query.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one installation batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallReport {
    pub requested: Vec<String>,
    pub installed: Vec<String>,
    pub failed: Vec<String>,
}

impl InstallReport {
    fn new(requested: &[String]) -> Self {
        InstallReport { requested: requested.to_vec(), ..Default::default() }
    }
}

/// Installs OS and interpreter packages via the process executor.
pub struct PackageInstaller {
    executor: ProcessExecutor,
}

impl PackageInstaller {
    pub fn new(executor: ProcessExecutor) -> Self {
        PackageInstaller { executor }
    }

    /// Install OS packages one at a time, skipping those already present.
    pub fn install_os_packages(&self, packages: &[String]) -> InstallReport {
        let mut report = InstallReport::new(packages);
        if packages.is_empty() {
            return report;
        }

        let missing: Vec<&String> = packages
            .iter()
            .filter(|pkg| {
                if self.os_package_present(pkg) {
                    info!(package = %pkg, "apt package already installed");
                    report.installed.push((*pkg).clone());
                    false
                } else {
                    true
                }
            })
            .collect();
        if missing.is_empty() {
            info!("all apt packages are already installed");
            return report;
        }

        self.update_package_list();

        for pkg in missing {
            info!(package = %pkg, "installing apt package");
            let result = self.executor.execute(
                ExecOpts::new(
                    vec![
                        "bash".to_string(),
                        "-c".to_string(),
                        format!("sudo apt-get install -y {pkg}"),
                    ],
                    INSTALL_TIMEOUT,
                    format!("apt({pkg})"),
                ),
            );
            if result.success() {
                info!(package = %pkg, "apt package installed");
                report.installed.push(pkg.clone());
            } else {
                warn_failure("apt", pkg, &result.stdout, result.exit_code, result.timed_out);
                report.failed.push(pkg.clone());
            }
        }
        log_batch(&report, "apt");
        report
    }

    /// Install interpreter packages into the workspace venv, one at a time.
    pub fn install_interpreter_packages(
        &self,
        workspace: &Workspace,
        packages: &[String],
    ) -> InstallReport {
        let mut report = InstallReport::new(packages);
        if packages.is_empty() {
            return report;
        }

        let pip = workspace.pip_path();
        for pkg in packages {
            info!(package = %pkg, "installing pip package");
            let result = self.executor.execute(
                ExecOpts::new(
                    vec![pip.display().to_string(), "install".to_string(), pkg.clone()],
                    INSTALL_TIMEOUT,
                    format!("pip({pkg})"),
                )
                .cwd(&workspace.root),
            );
            if result.success() {
                info!(package = %pkg, "pip package installed");
                report.installed.push(pkg.clone());
            } else {
                let output = if result.stderr.is_empty() { &result.stdout } else { &result.stderr };
                warn_failure("pip", pkg, output, result.exit_code, result.timed_out);
                report.failed.push(pkg.clone());
            }
        }
        log_batch(&report, "pip");
        report
    }

    fn os_package_present(&self, package: &str) -> bool {
        let result = self.executor.execute(ExecOpts::new(
            vec![
                "dpkg-query".to_string(),
                "-W".to_string(),
                "-f=${Status}".to_string(),
                package.to_string(),
            ],
            QUERY_TIMEOUT,
            format!("dpkg({package})"),
        ));
        result.success() && result.stdout.contains("install ok installed")
    }

    fn update_package_list(&self) {
        info!("updating apt package list");
        let result = self.executor.execute(ExecOpts::new(
            vec!["bash".to_string(), "-c".to_string(), "sudo apt-get update".to_string()],
            UPDATE_TIMEOUT,
            "apt-update".to_string(),
        ));
        if !result.success() {
            warn!(exit_code = ?result.exit_code, "apt-get update failed, continuing with installations");
        }
    }
}

fn warn_failure(manager: &str, package: &str, output: &str, exit_code: Option<i32>, timed_out: bool) {
    let tail: Vec<&str> = output.lines().rev().take(3).collect();
    warn!(
        manager,
        package,
        ?exit_code,
        timed_out,
        last_output = ?tail.into_iter().rev().collect::<Vec<_>>(),
        "package installation failed, continuing with next package"
    );
}

fn log_batch(report: &InstallReport, manager: &str) {
    if !report.installed.is_empty() {
        info!(manager, installed = ?report.installed, "packages installed");
    }
    if !report.failed.is_empty() {
        warn!(manager, failed = ?report.failed, "packages failed to install, script execution will continue anyway");
    }
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn empty_batches_are_no_ops() {
        let installer = PackageInstaller::new(ProcessExecutor::new());
        let report = installer.install_os_packages(&[]);
        assert!(report.requested.is_empty());
        assert!(report.installed.is_empty());
        assert!(report.failed.is_empty());

        let workspace = Workspace {
            root: PathBuf::from("/nonexistent"),
            venv: PathBuf::from("/nonexistent/venv"),
        };
        let report = installer.install_interpreter_packages(&workspace, &[]);
        assert!(report.requested.is_empty());
    }

    #[test]
    fn pip_failure_is_recorded_not_fatal() {
        // A workspace with no venv: pip is missing, so the install must land
        // in `failed` while the call itself succeeds.
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace {
            root: tmp.path().to_path_buf(),
            venv: tmp.path().join("venv"),
        };
        let installer = PackageInstaller::new(ProcessExecutor::new());
        let report =
            installer.install_interpreter_packages(&workspace, &["requests".to_string()]);
        assert_eq!(report.requested, vec!["requests"]);
        assert!(report.installed.is_empty());
        assert_eq!(report.failed, vec!["requests"]);
    }
}
