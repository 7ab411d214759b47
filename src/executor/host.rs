//! Host executor for trusted skills.
//!
//! Trusted skills run directly on the host, outside the sandbox boundary.
//! The run is still supervised: a scrubbed environment, the CPU and
//! wall-clock ceilings, and a fingerprint of the skill tree, its parent
//! directory and any configured watch paths, taken before and after so a
//! write outside the output directory is caught. With
//! `host_confinement = "bwrap"` the process additionally runs under a
//! read-only bubblewrap root.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use tracing::debug;

use crate::config::{HostConfinement, RuntimePaths, SandboxConfig};

use super::monitor::{classify_exit, DirFingerprint};
use super::redactor::Redactor;
use super::{
    wrap_with_cpu_limit, ExecRequest, ExecResult, Executor, ExecutorError, ExecutorKind,
    HealthStatus, Limits, Violation,
};

/// Minimal `PATH` handed to host processes.
const HOST_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Unsandboxed executor with host-side monitoring.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    config: SandboxConfig,
    outputs_dir: PathBuf,
    redactor: Redactor,
}

impl HostExecutor {
    /// Create a host executor writing outputs under the runtime paths.
    pub fn new(config: &SandboxConfig, paths: &RuntimePaths, redactor: Redactor) -> Self {
        Self {
            config: config.clone(),
            outputs_dir: paths.outputs_dir.clone(),
            redactor,
        }
    }

    /// Fingerprint the watched host locations this run must leave untouched.
    fn watch(&self, request: &ExecRequest) -> DirFingerprint {
        let root = &request.skill_root;
        let mut fingerprint = DirFingerprint::capture(root, &request.declared_output);
        if let Some(parent) = root.parent() {
            fingerprint.extend(DirFingerprint::capture_entries(parent, root));
        }
        for extra in &self.config.host_watch_paths {
            fingerprint.extend(DirFingerprint::capture_entries(extra, root));
        }
        fingerprint
    }

    fn command(&self, request: &ExecRequest) -> Command {
        let script = wrap_with_cpu_limit(&request.command, request.limits.cpu_seconds);
        let mut command = match self.config.host_confinement {
            HostConfinement::Monitor => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(script).current_dir(&request.skill_root);
                command
            }
            HostConfinement::Bwrap => {
                let mut command = Command::new("bwrap");
                command.args(bwrap_args(request)).arg("sh").arg("-c").arg(script);
                command
            }
        };
        // Interpreter caches and scratch files land in the output directory,
        // never in the skill tree or the shared temp directory.
        command
            .env_clear()
            .env("PATH", HOST_PATH)
            .env("HOME", &request.output_dir)
            .env("TMPDIR", &request.output_dir)
            .env("SKILL_OUTPUT_DIR", &request.output_dir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONPYCACHEPREFIX", request.output_dir.join(".pycache"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Bubblewrap arguments up to the `--` separator: read-only host root,
/// private `/dev` and `/proc`, and writable binds for the invocation output
/// and the skill's declared output directory only.
pub fn bwrap_args(request: &ExecRequest) -> Vec<OsString> {
    let output = request.output_dir.as_os_str();
    let declared = request.skill_root.join(&request.declared_output);
    let mut args: Vec<OsString> = ["--ro-bind", "/", "/", "--dev", "/dev", "--proc", "/proc"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.extend(["--bind".into(), output.to_owned(), output.to_owned()]);
    args.extend([
        "--bind-try".into(),
        declared.clone().into_os_string(),
        declared.into_os_string(),
    ]);
    args.extend(["--unshare-pid".into(), "--die-with-parent".into()]);
    args.extend(["--chdir".into(), request.skill_root.as_os_str().to_owned()]);
    args.push("--".into());
    args
}

#[async_trait::async_trait]
impl Executor for HostExecutor {
    async fn run(&self, request: &ExecRequest) -> Result<ExecResult, ExecutorError> {
        let before = self.watch(request);
        let mut command = self.command(request);

        let started = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| ExecutorError::SandboxFault(format!("failed to spawn: {e}")))?;

        // On timeout the future is dropped and `kill_on_drop` reaps the child.
        let waited = tokio::time::timeout(request.limits.timeout, child.wait_with_output()).await;
        let duration = started.elapsed();

        let output = match waited {
            Ok(result) => result.map_err(|e| ExecutorError::SandboxFault(e.to_string()))?,
            Err(_) => {
                debug!(skill = %request.skill_id, "host process exceeded wall clock");
                return Ok(ExecResult {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration,
                    violation: Some(Violation::WallClock {
                        seconds: request.limits.timeout.as_secs(),
                    }),
                });
            }
        };

        let exit_code = output.status.code().map(i64::from);
        let stdout_raw = String::from_utf8_lossy(&output.stdout);
        let stderr_raw = String::from_utf8_lossy(&output.stderr);

        let after = self.watch(request);
        let violation = before
            .first_change(&after)
            .map(|path| Violation::FilesystemWrite {
                path: Some(path.display().to_string()),
            })
            .or_else(|| classify_exit(exit_code, false, &stderr_raw, &request.limits));

        Ok(ExecResult {
            exit_code,
            stdout: self.redactor.redact(&stdout_raw),
            stderr: self.redactor.redact(&stderr_raw),
            duration,
            violation,
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, ExecutorError> {
        if self.config.host_confinement == HostConfinement::Bwrap
            && !HOST_PATH.split(':').any(|dir| Path::new(dir).join("bwrap").exists())
        {
            return Ok(HealthStatus::Unavailable {
                kind: ExecutorKind::Host,
                details: "bwrap confinement configured but bwrap not found".to_owned(),
            });
        }
        if Path::new("/bin/sh").exists() {
            Ok(HealthStatus::Healthy {
                kind: ExecutorKind::Host,
                details: "host shell available".to_owned(),
            })
        } else {
            Ok(HealthStatus::Unavailable {
                kind: ExecutorKind::Host,
                details: "/bin/sh not found".to_owned(),
            })
        }
    }

    fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    fn ceilings(&self) -> Limits {
        Limits::from_config(&self.config)
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Host
    }
}
