//! Docker-backed sandbox executor with hardening defaults.
//!
//! Every invocation gets a fresh container: skill source mounted read-only
//! at `/skill`, the per-invocation output directory as the only writable
//! bind at `/output`, read-only root filesystem, all capabilities dropped,
//! and no network unless the skill declares egress, in which case the only
//! route out is the egress proxy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::audit::filesystem::SANDBOX_OUTPUT_MOUNT;
use crate::config::{RuntimePaths, SandboxConfig};

use super::egress::{EgressProxy, EgressTable};
use super::monitor::{classify_exit, read_only_write};
use super::redactor::Redactor;
use super::{
    wrap_with_cpu_limit, ExecRequest, ExecResult, Executor, ExecutorError, ExecutorKind,
    HealthStatus, Limits, Violation,
};

const SKILL_MOUNT: &str = "/skill";
const PYTHON_IMAGE: &str = "python:3.12-slim";
const NODE_IMAGE: &str = "node:20-alpine";
const ALPINE_IMAGE: &str = "alpine:3.20";
/// How often a running sandbox is checked for egress denials and blocked
/// writes.
const SUPERVISION_INTERVAL: Duration = Duration::from_millis(500);

/// Docker-backed sandbox executor.
#[derive(Debug)]
pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
    outputs_dir: PathBuf,
    redactor: Redactor,
    proxy: Mutex<Option<EgressProxy>>,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::SandboxFault`] when Docker cannot be reached.
    pub async fn new(
        config: &SandboxConfig,
        paths: &RuntimePaths,
        redactor: Redactor,
    ) -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutorError::SandboxFault(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| ExecutorError::SandboxFault(format!("docker daemon unreachable: {e}")))?;

        Ok(Self {
            docker,
            config: config.clone(),
            outputs_dir: paths.outputs_dir.clone(),
            redactor,
            proxy: Mutex::new(None),
        })
    }

    /// Remove the egress proxy container and network.
    pub async fn shutdown(&self) {
        let mut guard = self.proxy.lock().await;
        if guard.take().is_some() {
            EgressProxy::teardown(&self.docker).await;
            info!("egress proxy removed");
        }
    }

    /// Bring the egress proxy in line with a full allowlist table.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::SandboxFault`] if the proxy cannot be
    /// started or reconfigured.
    pub async fn sync_egress(&self, table: EgressTable) -> Result<(), ExecutorError> {
        let table: EgressTable = table.into_iter().filter(|(_, v)| !v.is_empty()).collect();
        let mut guard = self.proxy.lock().await;
        match guard.as_mut() {
            Some(proxy) if proxy.table() == &table => Ok(()),
            Some(proxy) => proxy.reload(&self.docker, table).await,
            None => {
                *guard = Some(EgressProxy::ensure(&self.docker, table).await?);
                Ok(())
            }
        }
    }

    /// Proxy snapshot covering the request's skill, if it needs egress.
    async fn proxy_for(&self, request: &ExecRequest) -> Result<Option<EgressProxy>, ExecutorError> {
        if request.egress.is_empty() {
            return Ok(None);
        }
        let mut guard = self.proxy.lock().await;
        let current = guard.as_ref().map(|p| p.table().clone()).unwrap_or_default();
        if current.get(&request.skill_id) != Some(&request.egress) {
            let mut table = current;
            table.insert(request.skill_id.clone(), request.egress.clone());
            match guard.as_mut() {
                Some(proxy) => proxy.reload(&self.docker, table).await?,
                None => *guard = Some(EgressProxy::ensure(&self.docker, table).await?),
            }
        }
        Ok(guard.clone())
    }

    async fn run_container(
        &self,
        name: &str,
        request: &ExecRequest,
        proxy: Option<&EgressProxy>,
    ) -> Result<ExecResult, ExecutorError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutorError::SandboxFault(format!("failed to start sandbox: {e}")))?;
        let started = Instant::now();
        let since = unix_now();

        let supervised = self.supervise(name, request, proxy, since).await?;
        let duration = started.elapsed();

        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| ExecutorError::SandboxFault(e.to_string()))?;
        let state = inspect.state.unwrap_or_default();
        let oom_killed = state.oom_killed.unwrap_or(false);
        let exit_code = if supervised.is_some() {
            None
        } else {
            state.exit_code
        };

        let (stdout_raw, stderr_raw) = self.collect_logs(name).await?;
        let violation = supervised
            .or_else(|| classify_exit(exit_code, oom_killed, &stderr_raw, &request.limits));

        Ok(ExecResult {
            exit_code,
            stdout: self.redactor.redact(&stdout_raw),
            stderr: self.redactor.redact(&stderr_raw),
            duration,
            violation,
        })
    }

    /// Wait for the container while enforcing the wall clock, egress and
    /// write rules. Returns the violation that ended the run early.
    async fn supervise(
        &self,
        name: &str,
        request: &ExecRequest,
        proxy: Option<&EgressProxy>,
        since: f64,
    ) -> Result<Option<Violation>, ExecutorError> {
        let mut wait = Box::pin(
            self.docker
                .wait_container(name, None::<WaitContainerOptions<String>>),
        );
        let deadline = tokio::time::sleep(request.limits.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(SUPERVISION_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = wait.next() => {
                    match next {
                        None | Some(Ok(_)) => break,
                        Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                            debug!(container = %name, code, "sandbox exited with error status");
                            break;
                        }
                        Some(Err(e)) => {
                            return Err(ExecutorError::SandboxFault(format!(
                                "lost track of sandbox: {e}"
                            )));
                        }
                    }
                }
                () = &mut deadline => {
                    self.kill(name).await;
                    return Ok(Some(Violation::WallClock {
                        seconds: request.limits.timeout.as_secs(),
                    }));
                }
                _ = ticker.tick() => {
                    if let Some(violation) = self.check_running(name, request, proxy, since).await? {
                        self.kill(name).await;
                        return Ok(Some(violation));
                    }
                }
            }
        }

        // Denials logged between the last tick and exit still count.
        match proxy {
            Some(proxy) => Ok(proxy
                .denials(&self.docker, &request.skill_id, since)
                .await?
                .into_iter()
                .next()
                .map(|d| Violation::Egress { domain: d.host })),
            None => Ok(None),
        }
    }

    async fn check_running(
        &self,
        name: &str,
        request: &ExecRequest,
        proxy: Option<&EgressProxy>,
        since: f64,
    ) -> Result<Option<Violation>, ExecutorError> {
        if let Some(proxy) = proxy {
            let denials = proxy.denials(&self.docker, &request.skill_id, since).await?;
            if let Some(denial) = denials.into_iter().next() {
                return Ok(Some(Violation::Egress {
                    domain: denial.host,
                }));
            }
        }
        let (_, stderr) = self.collect_logs(name).await?;
        Ok(read_only_write(&stderr).map(|path| Violation::FilesystemWrite { path }))
    }

    async fn kill(&self, name: &str) {
        let options = KillContainerOptions { signal: "SIGKILL" };
        if let Err(e) = self.docker.kill_container(name, Some(options)).await {
            // Already exited between the check and the kill.
            debug!(container = %name, error = %e, "kill failed");
        }
    }

    async fn collect_logs(&self, name: &str) -> Result<(String, String), ExecutorError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            let log = chunk.map_err(|e| ExecutorError::SandboxFault(e.to_string()))?;
            match log {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            warn!(container = %name, error = %e, "failed to remove sandbox container");
        }
    }
}

#[async_trait::async_trait]
impl Executor for DockerSandbox {
    async fn run(&self, request: &ExecRequest) -> Result<ExecResult, ExecutorError> {
        let image = select_image(&request.dependencies, self.config.image.as_deref());
        ensure_image(&self.docker, image).await?;
        let proxy = self.proxy_for(request).await?;

        let name = container_name(request);
        let container_config =
            build_container_config(request, image, &self.config, proxy.as_ref())?;
        let options = Some(CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });
        self.docker
            .create_container(options, container_config)
            .await
            .map_err(|e| ExecutorError::SandboxFault(format!("failed to create sandbox: {e}")))?;
        info!(skill = %request.skill_id, container = %name, image, "sandbox created");

        let result = self.run_container(&name, request, proxy.as_ref()).await;
        self.remove(&name).await;
        result
    }

    async fn health_check(&self) -> Result<HealthStatus, ExecutorError> {
        match self.docker.ping().await {
            Ok(_) => Ok(HealthStatus::Healthy {
                kind: ExecutorKind::Sandbox,
                details: "docker daemon reachable".to_owned(),
            }),
            Err(e) => Ok(HealthStatus::Unavailable {
                kind: ExecutorKind::Sandbox,
                details: format!("docker daemon unreachable: {e}"),
            }),
        }
    }

    fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    fn ceilings(&self) -> Limits {
        Limits::from_config(&self.config)
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Sandbox
    }
}

/// Pull an image unless it is already present locally.
///
/// # Errors
///
/// Returns [`ExecutorError::SandboxFault`] when the pull fails.
pub(crate) async fn ensure_image(docker: &Docker, image: &str) -> Result<(), ExecutorError> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }
    info!(image, "pulling image");
    let options = Some(CreateImageOptions {
        from_image: image,
        ..Default::default()
    });
    let mut pull = docker.create_image(options, None, None);
    while let Some(progress) = pull.next().await {
        progress.map_err(|e| ExecutorError::SandboxFault(format!("failed to pull {image}: {e}")))?;
    }
    Ok(())
}

/// Base image for a skill's declared dependencies.
pub fn select_image<'a>(dependencies: &[String], override_image: Option<&'a str>) -> &'a str {
    if let Some(image) = override_image {
        return image;
    }
    let has = |names: &[&str]| {
        dependencies
            .iter()
            .any(|d| names.iter().any(|n| d.trim().eq_ignore_ascii_case(n)))
    };
    if has(&["node", "nodejs", "npm", "npx"]) {
        NODE_IMAGE
    } else if has(&["gh"]) {
        ALPINE_IMAGE
    } else {
        PYTHON_IMAGE
    }
}

fn container_name(request: &ExecRequest) -> String {
    let short: String = request.invocation_id.chars().take(8).collect();
    format!("skillgate-{}-{short}", request.skill_id)
}

fn build_container_config(
    request: &ExecRequest,
    image: &str,
    config: &SandboxConfig,
    proxy: Option<&EgressProxy>,
) -> Result<ContainerConfig<String>, ExecutorError> {
    let memory_limit = i64::from(request.limits.memory_mb)
        .saturating_mul(1024)
        .saturating_mul(1024);
    let cpu_limit = cores_to_nano_cpus(config.cpu_cores)?;

    // No tmpfs: the output mount is the only writable path, so every write
    // either lands in the output or fails against the read-only root.
    let mut env = vec![
        format!("SKILL_OUTPUT_DIR={SANDBOX_OUTPUT_MOUNT}"),
        format!("HOME={SANDBOX_OUTPUT_MOUNT}"),
        format!("TMPDIR={SANDBOX_OUTPUT_MOUNT}"),
        "PYTHONDONTWRITEBYTECODE=1".to_owned(),
    ];
    let proxy_url = proxy.and_then(|p| p.proxy_url(&request.skill_id));
    if let Some(url) = &proxy_url {
        for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            env.push(format!("{key}={url}"));
        }
    }
    let network_mode = match (proxy, &proxy_url) {
        (Some(proxy), Some(_)) => proxy.network_name().to_owned(),
        _ => "none".to_owned(),
    };

    let mut labels = HashMap::new();
    labels.insert("skillgate".to_owned(), "sandbox".to_owned());
    labels.insert("skillgate.skill".to_owned(), request.skill_id.to_string());

    let host_config = HostConfig {
        network_mode: Some(network_mode),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_owned()]),
        security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
        pids_limit: Some(config.pids_limit),
        memory: Some(memory_limit),
        memory_swap: Some(memory_limit),
        nano_cpus: Some(cpu_limit),
        binds: Some(vec![
            format!("{}:{SKILL_MOUNT}:ro", request.skill_root.display()),
            format!("{}:{SANDBOX_OUTPUT_MOUNT}:rw", request.output_dir.display()),
        ]),
        ..Default::default()
    };

    Ok(ContainerConfig {
        image: Some(image.to_owned()),
        cmd: Some(vec![
            "sh".to_owned(),
            "-c".to_owned(),
            wrap_with_cpu_limit(&request.command, request.limits.cpu_seconds),
        ]),
        working_dir: Some(SKILL_MOUNT.to_owned()),
        env: Some(env),
        labels: Some(labels),
        network_disabled: Some(proxy_url.is_none()),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Convert a core count into Docker's nano-CPU units without float casts.
fn cores_to_nano_cpus(cpu_cores: f64) -> Result<i64, ExecutorError> {
    if !cpu_cores.is_finite() || cpu_cores <= 0.0 {
        return Err(ExecutorError::InvalidInput(
            "cpu_cores must be a positive finite number".to_owned(),
        ));
    }
    let rendered = format!("{cpu_cores:.3}");
    let (whole, millis) = rendered.split_once('.').unwrap_or((rendered.as_str(), "0"));
    let whole = whole
        .parse::<i64>()
        .map_err(|e| ExecutorError::InvalidInput(e.to_string()))?;
    let millis = millis
        .parse::<i64>()
        .map_err(|e| ExecutorError::InvalidInput(e.to_string()))?;
    whole
        .checked_mul(1000)
        .and_then(|w| w.checked_add(millis))
        .and_then(|m| m.checked_mul(1_000_000))
        .filter(|nanos| *nanos > 0)
        .ok_or_else(|| ExecutorError::InvalidInput("cpu_cores out of range".to_owned()))
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
