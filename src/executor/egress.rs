//! Egress proxy management for sandbox network control.
//!
//! Sandboxes with a non-empty allowlist join an internal Docker network
//! whose only route out is a Squid forward proxy. Every skill gets its own
//! proxy port, and each port carries an ACL built from that skill's
//! allowlist, so the proxy log attributes every denied request to exactly
//! one skill.

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::Docker;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::monitor::{parse_denial, Denial};
use super::ExecutorError;
use crate::skill::SkillId;

const SQUID_IMAGE: &str = "ubuntu/squid:latest";
pub(crate) const SQUID_CONTAINER_NAME: &str = "skillgate-egress";
pub(crate) const NETWORK_NAME: &str = "skillgate-net";
/// First port handed out to a skill.
const BASE_PORT: u16 = 3200;

/// Per-skill allowlists keyed by skill id.
pub type EgressTable = BTreeMap<SkillId, Vec<String>>;

/// Egress proxy backed by a Squid container on an internal Docker network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressProxy {
    ports: HashMap<SkillId, u16>,
    table: EgressTable,
}

impl EgressProxy {
    /// Ensure the proxy is running with the given per-skill allowlists.
    ///
    /// Creates the network and the Squid container if they don't exist. A
    /// container whose configuration drifted is recreated.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::SandboxFault`] if Docker operations fail.
    pub async fn ensure(docker: &Docker, table: EgressTable) -> Result<Self, ExecutorError> {
        ensure_network(docker).await?;
        let proxy = Self::plan(table);
        ensure_squid_container(docker, &generate_squid_config(&proxy)).await?;
        Ok(proxy)
    }

    /// Assign ports without touching Docker.
    pub fn plan(table: EgressTable) -> Self {
        let ports = table
            .keys()
            .zip(BASE_PORT..)
            .map(|(id, port)| (id.clone(), port))
            .collect();
        Self { ports, table }
    }

    /// Push a new table into the running proxy without a restart.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::SandboxFault`] if the reload command fails.
    pub async fn reload(&mut self, docker: &Docker, table: EgressTable) -> Result<(), ExecutorError> {
        let next = Self::plan(table);
        let config = generate_squid_config(&next);
        let script = format!(
            "echo {} | base64 -d > /etc/squid/squid.conf && squid -k reconfigure",
            base64_encode(&config)
        );
        run_in_proxy(docker, script).await?;
        info!(skills = next.table.len(), "egress proxy reconfigured");
        *self = next;
        Ok(())
    }

    /// Current allowlist table.
    pub fn table(&self) -> &EgressTable {
        &self.table
    }

    /// Proxy port assigned to a skill.
    pub fn port_for(&self, skill_id: &SkillId) -> Option<u16> {
        self.ports.get(skill_id).copied()
    }

    /// Proxy URL for `HTTP_PROXY` / `HTTPS_PROXY` inside a sandbox.
    pub fn proxy_url(&self, skill_id: &SkillId) -> Option<String> {
        self.port_for(skill_id)
            .map(|port| format!("http://{SQUID_CONTAINER_NAME}:{port}"))
    }

    /// Docker network that sandboxes with egress must join.
    pub fn network_name(&self) -> &'static str {
        NETWORK_NAME
    }

    /// Denied requests on a skill's port at or after `since` (unix seconds).
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::SandboxFault`] if the proxy log cannot be read.
    pub async fn denials(
        &self,
        docker: &Docker,
        skill_id: &SkillId,
        since: f64,
    ) -> Result<Vec<Denial>, ExecutorError> {
        let Some(port) = self.port_for(skill_id) else {
            return Ok(Vec::new());
        };
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: false,
            since: since_seconds(since),
            ..Default::default()
        };
        let mut stream = docker.logs(SQUID_CONTAINER_NAME, Some(options));
        let mut denials = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| ExecutorError::SandboxFault(format!("egress log: {e}")))?;
            let LogOutput::StdOut { message } = chunk else {
                continue;
            };
            for line in String::from_utf8_lossy(&message).lines() {
                if let Some(denial) = parse_denial(line) {
                    if denial.port == port && denial.timestamp >= since {
                        denials.push(denial);
                    }
                }
            }
        }
        Ok(denials)
    }

    /// Tear down the egress proxy container and network.
    pub async fn teardown(docker: &Docker) {
        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        // Ignore 404 (already removed).
        let _ = docker
            .remove_container(SQUID_CONTAINER_NAME, Some(remove_opts))
            .await;
        let _ = docker.remove_network(NETWORK_NAME).await;
    }
}

/// Docker's log filter only takes whole seconds; round down and filter the
/// rest by timestamp.
fn since_seconds(since: f64) -> i64 {
    format!("{since:.0}")
        .parse::<i64>()
        .map_or(0, |secs| secs.saturating_sub(1))
}

/// Generate a Squid configuration with one port and one ACL per skill.
#[doc(hidden)]
pub fn generate_squid_config(proxy: &EgressProxy) -> String {
    let mut config = String::new();
    config.push_str("# skillgate egress proxy, generated\n");
    config.push_str("logformat skillgate %ts.%03tu %>a %>lp %Ss/%03>Hs %rm %ru\n");
    config.push_str("access_log stdio:/dev/stdout skillgate\n");
    config.push_str("cache_log stdio:/dev/stderr\n");
    config.push_str("cache deny all\n\n");
    config.push_str("acl SSL_ports port 443\n");
    config.push_str("acl CONNECT method CONNECT\n");
    config.push_str("http_access deny CONNECT !SSL_ports\n\n");

    for (skill_id, allowlist) in &proxy.table {
        let Some(port) = proxy.port_for(skill_id) else {
            continue;
        };
        let acl = format!("skill_{port}");
        config.push_str(&format!("# {skill_id}\n"));
        config.push_str(&format!("http_port {port} name={acl}\n"));
        config.push_str(&format!("acl {acl}_port myportname {acl}\n"));
        let mut domains = 0usize;
        for entry in allowlist {
            let entry = entry.trim().trim_start_matches("*.");
            if entry.is_empty() || entry == "*" {
                continue;
            }
            let kind = if entry.parse::<std::net::IpAddr>().is_ok() {
                "dst"
            } else {
                "dstdomain"
            };
            let value = if kind == "dst" {
                entry.to_owned()
            } else {
                format!(".{entry}")
            };
            config.push_str(&format!("acl {acl}_allowed {kind} {value}\n"));
            domains = domains.saturating_add(1);
        }
        if domains > 0 {
            config.push_str(&format!("http_access allow {acl}_port {acl}_allowed\n"));
        }
        config.push('\n');
    }

    if proxy.table.is_empty() {
        // Squid refuses to start without a listening port.
        config.push_str(&format!("http_port {BASE_PORT}\n"));
    }
    config.push_str("http_access deny all\n");
    config
}

/// Ensure the internal Docker network exists.
pub(crate) async fn ensure_network(docker: &Docker) -> Result<(), ExecutorError> {
    if docker
        .inspect_network::<&str>(NETWORK_NAME, None)
        .await
        .is_ok()
    {
        return Ok(());
    }

    let options = CreateNetworkOptions {
        name: NETWORK_NAME,
        driver: "bridge",
        internal: true,
        ..Default::default()
    };
    docker
        .create_network(options)
        .await
        .map_err(|e| ExecutorError::SandboxFault(format!("failed to create network: {e}")))?;
    Ok(())
}

/// Ensure the Squid container runs with the given config, recreating it when
/// the config drifted.
async fn ensure_squid_container(docker: &Docker, squid_config: &str) -> Result<(), ExecutorError> {
    let desired_b64 = base64_encode(squid_config);
    let inspect = docker
        .inspect_container(SQUID_CONTAINER_NAME, None::<InspectContainerOptions>)
        .await;

    let needs_start = match inspect {
        Ok(state) => {
            let running = state.state.and_then(|s| s.running).unwrap_or(false);
            let current_b64 = state
                .config
                .as_ref()
                .and_then(|c| c.env.as_ref())
                .and_then(|env| {
                    env.iter()
                        .find_map(|e| e.strip_prefix("SQUID_CONFIG_B64="))
                        .map(ToOwned::to_owned)
                });

            if current_b64.as_deref() == Some(desired_b64.as_str()) {
                !running
            } else {
                info!("egress proxy config drifted, recreating container");
                let remove_opts = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                let _ = docker
                    .remove_container(SQUID_CONTAINER_NAME, Some(remove_opts))
                    .await;
                create_squid_container(docker, &desired_b64).await?;
                true
            }
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            create_squid_container(docker, &desired_b64).await?;
            true
        }
        Err(e) => {
            return Err(ExecutorError::SandboxFault(format!(
                "failed to inspect egress proxy: {e}"
            )));
        }
    };

    if needs_start {
        docker
            .start_container(SQUID_CONTAINER_NAME, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                ExecutorError::SandboxFault(format!("failed to start egress proxy: {e}"))
            })?;
    }
    Ok(())
}

/// Create the Squid container on the default bridge and attach it to the
/// internal network, so it is the only member with a route out.
async fn create_squid_container(docker: &Docker, config_b64: &str) -> Result<(), ExecutorError> {
    super::docker::ensure_image(docker, SQUID_IMAGE).await?;

    let mut labels = HashMap::new();
    labels.insert("skillgate".to_owned(), "egress".to_owned());

    let host_config = HostConfig {
        network_mode: Some("bridge".to_owned()),
        restart_policy: Some(bollard::models::RestartPolicy {
            name: Some(bollard::models::RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    let container_config = ContainerConfig {
        image: Some(SQUID_IMAGE.to_owned()),
        labels: Some(labels),
        env: Some(vec![format!("SQUID_CONFIG_B64={config_b64}")]),
        cmd: Some(vec![
            "bash".to_owned(),
            "-c".to_owned(),
            "echo \"$SQUID_CONFIG_B64\" | base64 -d > /etc/squid/squid.conf && squid -NYC"
                .to_owned(),
        ]),
        host_config: Some(host_config),
        ..Default::default()
    };

    let options = Some(CreateContainerOptions {
        name: SQUID_CONTAINER_NAME.to_owned(),
        platform: None,
    });
    docker
        .create_container(options, container_config)
        .await
        .map_err(|e| {
            ExecutorError::SandboxFault(format!("failed to create egress proxy container: {e}"))
        })?;

    docker
        .connect_network(
            NETWORK_NAME,
            ConnectNetworkOptions {
                container: SQUID_CONTAINER_NAME,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| {
            ExecutorError::SandboxFault(format!("failed to attach egress proxy to network: {e}"))
        })?;
    Ok(())
}

async fn run_in_proxy(docker: &Docker, script: String) -> Result<(), ExecutorError> {
    let created = docker
        .create_exec(
            SQUID_CONTAINER_NAME,
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(vec!["bash".to_owned(), "-c".to_owned(), script]),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| ExecutorError::SandboxFault(e.to_string()))?;

    let started = docker
        .start_exec(
            &created.id,
            Some(StartExecOptions {
                detach: false,
                tty: false,
                output_capacity: None,
            }),
        )
        .await
        .map_err(|e| ExecutorError::SandboxFault(e.to_string()))?;
    if let StartExecResults::Attached { mut output, .. } = started {
        while let Some(chunk) = output.next().await {
            if let Ok(log) = chunk {
                debug!(output = %log, "egress proxy reload");
            }
        }
    }

    let inspect = docker
        .inspect_exec(&created.id)
        .await
        .map_err(|e| ExecutorError::SandboxFault(e.to_string()))?;
    match inspect.exit_code {
        Some(0) => Ok(()),
        other => Err(ExecutorError::SandboxFault(format!(
            "egress proxy reload exited with {other:?}"
        ))),
    }
}

/// Encode a string as standard base64.
fn base64_encode(input: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(input)
}
