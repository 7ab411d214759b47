//! Configuration loading and validation.
//!
//! `config.toml` is human-owned: skills can never write it, and nothing under
//! the data directory is mounted into a sandbox. Every section has defaults,
//! so an empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::policy::RiskLevel;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Filesystem locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Sandbox resource limits and concurrency.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Trust promotion settings.
    #[serde(default)]
    pub trust: TrustConfig,

    /// Human-in-the-loop approval settings.
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Static audit heuristics.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Filesystem overrides. Unset values derive from the config directory.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Data directory holding the ledger database, outputs and logs.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Directory scanned for installed skills.
    #[serde(default)]
    pub skills_dir: Option<PathBuf>,
}

/// What to do when a skill is already executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Queue behind the running invocation.
    #[default]
    Wait,
    /// Reject immediately with `Busy`.
    Reject,
}

/// How trusted skills are contained on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostConfinement {
    /// Run under `sh` and watch the surrounding filesystem for writes.
    #[default]
    Monitor,
    /// Run under bubblewrap with a read-only root; only the output
    /// directories are writable. The watch still runs.
    Bwrap,
}

/// Sandbox resource limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Memory ceiling in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    /// CPU core limit.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,

    /// CPU time ceiling in seconds.
    #[serde(default = "default_cpu_seconds")]
    pub cpu_seconds: u64,

    /// Wall-clock ceiling in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum number of processes inside one sandbox.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Global ceiling on concurrently running invocations.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Retries for infrastructure faults before giving up.
    #[serde(default = "default_fault_retries")]
    pub fault_retries: u32,

    /// Image override; otherwise chosen from manifest dependencies.
    #[serde(default)]
    pub image: Option<String>,

    /// Behaviour when the skill already has an invocation in flight.
    #[serde(default)]
    pub busy: BusyPolicy,

    /// Containment for host runs of trusted skills.
    #[serde(default)]
    pub host_confinement: HostConfinement,

    /// Extra host directories whose direct entries are watched during
    /// host runs, in addition to the skill tree and its parent.
    #[serde(default)]
    pub host_watch_paths: Vec<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpu_cores: default_cpu_cores(),
            cpu_seconds: default_cpu_seconds(),
            timeout_secs: default_timeout_secs(),
            pids_limit: default_pids_limit(),
            max_concurrent: default_max_concurrent(),
            fault_retries: default_fault_retries(),
            image: None,
            busy: BusyPolicy::default(),
            host_confinement: HostConfinement::default(),
            host_watch_paths: Vec::new(),
        }
    }
}

/// Trust promotion settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrustConfig {
    /// Consecutive clean runs needed before promotion eligibility.
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: u32,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: default_promotion_threshold(),
        }
    }
}

/// Human-in-the-loop approval settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApprovalConfig {
    /// Seconds a per-action approval request stays open.
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,

    /// Seconds a promotion approval request stays open.
    #[serde(default = "default_promotion_timeout")]
    pub promotion_timeout_secs: u64,

    /// Session lease window in minutes.
    #[serde(default = "default_lease_minutes")]
    pub lease_minutes: i64,

    /// Lowest risk level that needs approval.
    #[serde(default = "default_approval_threshold")]
    pub threshold: RiskLevel,

    /// Identities allowed to approve promotions. Empty means any approver.
    #[serde(default)]
    pub promotion_approvers: Vec<String>,

    /// Seconds a decided request stays queryable before it is forgotten.
    #[serde(default = "default_resolved_retention")]
    pub resolved_retention_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout(),
            promotion_timeout_secs: default_promotion_timeout(),
            lease_minutes: default_lease_minutes(),
            threshold: default_approval_threshold(),
            promotion_approvers: Vec::new(),
            resolved_retention_secs: default_resolved_retention(),
        }
    }
}

/// Static audit heuristics.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Shannon entropy (bits per char) at which a literal is suspicious.
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,

    /// Minimum literal length considered for the entropy check.
    #[serde(default = "default_min_entropy_len")]
    pub min_entropy_len: usize,

    /// Length at which a base64-like blob becomes a Medium finding.
    #[serde(default = "default_encoded_blob_len")]
    pub encoded_blob_len: usize,

    /// Length at which a base64-like blob becomes a High finding.
    #[serde(default = "default_encoded_blob_high_len")]
    pub encoded_blob_high_len: usize,

    /// Largest file read as text.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// File extensions scanned as source text.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            entropy_threshold: default_entropy_threshold(),
            min_entropy_len: default_min_entropy_len(),
            encoded_blob_len: default_encoded_blob_len(),
            encoded_blob_high_len: default_encoded_blob_high_len(),
            max_file_bytes: default_max_file_bytes(),
            extensions: default_extensions(),
        }
    }
}

// Default value functions for serde

fn default_memory_mb() -> u32 {
    512
}
fn default_cpu_cores() -> f64 {
    1.0
}
fn default_cpu_seconds() -> u64 {
    60
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_pids_limit() -> i64 {
    128
}
fn default_max_concurrent() -> usize {
    4
}
fn default_fault_retries() -> u32 {
    2
}
fn default_promotion_threshold() -> u32 {
    100
}
fn default_approval_timeout() -> u64 {
    300
}
fn default_promotion_timeout() -> u64 {
    86_400
}
fn default_resolved_retention() -> u64 {
    3_600
}
fn default_lease_minutes() -> i64 {
    30
}
fn default_approval_threshold() -> RiskLevel {
    RiskLevel::Medium
}
fn default_entropy_threshold() -> f64 {
    4.5
}
fn default_min_entropy_len() -> usize {
    24
}
fn default_encoded_blob_len() -> usize {
    120
}
fn default_encoded_blob_high_len() -> usize {
    1024
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}
fn default_extensions() -> Vec<String> {
    [
        "py", "js", "mjs", "cjs", "ts", "rs", "cpp", "c", "h", "go", "rb", "sh", "bash", "pl",
        "php", "lua",
    ]
    .iter()
    .map(|e| (*e).to_owned())
    .collect()
}

/// Resolved on-disk layout.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Config directory (`~/.skillgate`).
    pub root: PathBuf,
    /// `config.toml` location.
    pub config_file: PathBuf,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Trust ledger database.
    pub ledger_db: PathBuf,
    /// Installed skills.
    pub skills_dir: PathBuf,
    /// Per-invocation output directories.
    pub outputs_dir: PathBuf,
    /// Log files.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Derive the layout from a config directory and optional overrides.
    pub fn resolve(root: &Path, paths: &PathsConfig) -> Self {
        let data_dir = paths.data_dir.clone().unwrap_or_else(|| root.join("data"));
        let skills_dir = paths
            .skills_dir
            .clone()
            .unwrap_or_else(|| root.join("skills"));
        Self {
            root: root.to_path_buf(),
            config_file: root.join("config.toml"),
            ledger_db: data_dir.join("ledger.db"),
            outputs_dir: data_dir.join("outputs"),
            logs_dir: data_dir.join("logs"),
            data_dir,
            skills_dir,
        }
    }

    /// Create every directory in the layout.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [
            &self.root,
            &self.data_dir,
            &self.skills_dir,
            &self.outputs_dir,
            &self.logs_dir,
        ] {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", dir.display()))?;
        }
        Ok(())
    }
}

/// Load the config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Load the config if the file exists, otherwise return defaults.
///
/// # Errors
///
/// Returns an error if an existing file cannot be read or parsed.
pub fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

fn validate(config: &Config) -> anyhow::Result<()> {
    if config.sandbox.max_concurrent == 0 {
        anyhow::bail!("sandbox.max_concurrent must be at least 1");
    }
    if config.trust.promotion_threshold == 0 {
        anyhow::bail!("trust.promotion_threshold must be at least 1");
    }
    if config.approval.lease_minutes <= 0 {
        anyhow::bail!("approval.lease_minutes must be positive");
    }
    if !config.sandbox.cpu_cores.is_finite() || config.sandbox.cpu_cores <= 0.0 {
        anyhow::bail!("sandbox.cpu_cores must be a positive finite number");
    }
    if let Some(path) = config.sandbox.host_watch_paths.iter().find(|p| !p.is_absolute()) {
        anyhow::bail!("sandbox.host_watch_paths entry {} must be absolute", path.display());
    }
    Ok(())
}

/// Resolve the default config directory (`~/.skillgate/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".skillgate"))
}
