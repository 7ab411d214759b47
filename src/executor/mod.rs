//! Skill execution: the sandbox and host executors behind one trait.
//!
//! [`execute`] is the single entry point. It renders the requested command
//! from the manifest template, runs the pre-flight egress check, hands the
//! request to an [`Executor`] and turns the result into an [`Invocation`]
//! for the trust ledger.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::ledger::{Invocation, Outcome};
use crate::policy::PolicyEngine;
use crate::skill::{CommandSpec, ResourceLimits, Skill, SkillId};

pub mod docker;
pub mod egress;
pub mod host;
pub mod monitor;
pub mod redactor;

/// Executor implementation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Docker-backed sandbox.
    Sandbox,
    /// Unsandboxed host execution for trusted skills.
    Host,
}

impl ExecutorKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Host => "host",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Effective resource ceilings for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// CPU time in seconds.
    pub cpu_seconds: u64,
    /// Memory in megabytes.
    pub memory_mb: u32,
    /// Wall-clock timeout.
    pub timeout: Duration,
}

impl Limits {
    /// Ceilings from the sandbox configuration.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            cpu_seconds: config.cpu_seconds.max(1),
            memory_mb: config.memory_mb.max(16),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    /// Narrow the ceilings with the values a manifest requests.
    ///
    /// A manifest can only lower a ceiling, never raise it.
    pub fn narrowed_by(self, requested: &ResourceLimits) -> Self {
        Self {
            cpu_seconds: requested
                .cpu_seconds
                .map_or(self.cpu_seconds, |v| v.clamp(1, self.cpu_seconds)),
            memory_mb: requested
                .memory_mb
                .map_or(self.memory_mb, |v| v.clamp(16, self.memory_mb)),
            timeout: requested
                .timeout_secs
                .map_or(self.timeout, |v| {
                    Duration::from_secs(v.max(1)).min(self.timeout)
                }),
        }
    }
}

/// A rendered, policy-checked command ready to run.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Invocation identifier, also used to name the container.
    pub invocation_id: String,
    /// Skill being run.
    pub skill_id: SkillId,
    /// Host path of the skill source, mounted read-only.
    pub skill_root: PathBuf,
    /// Skill-relative output directory declared by the manifest.
    pub declared_output: PathBuf,
    /// Host directory that receives this invocation's output.
    pub output_dir: PathBuf,
    /// Fully rendered shell command.
    pub command: String,
    /// Domains the skill may contact.
    pub egress: Vec<String>,
    /// Declared runtime dependencies.
    pub dependencies: Vec<String>,
    /// Effective resource ceilings.
    pub limits: Limits,
}

/// A policy breach observed while a command ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Contact with a domain outside the allowlist.
    Egress {
        /// Denied destination.
        domain: String,
    },
    /// Write outside the output directory.
    FilesystemWrite {
        /// Offending path, when it could be determined.
        path: Option<String>,
    },
    /// CPU time ceiling exceeded.
    CpuCeiling {
        /// Ceiling in seconds.
        seconds: u64,
    },
    /// Memory ceiling exceeded.
    MemoryCeiling {
        /// Ceiling in megabytes.
        megabytes: u32,
    },
    /// Wall-clock ceiling exceeded.
    WallClock {
        /// Ceiling in seconds.
        seconds: u64,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Egress { domain } => write!(f, "disallowed egress to {domain}"),
            Self::FilesystemWrite { path: Some(path) } => {
                write!(f, "write outside output directory: {path}")
            }
            Self::FilesystemWrite { path: None } => f.write_str("write outside output directory"),
            Self::CpuCeiling { seconds } => write!(f, "cpu time ceiling of {seconds}s exceeded"),
            Self::MemoryCeiling { megabytes } => {
                write!(f, "memory ceiling of {megabytes}MB exceeded")
            }
            Self::WallClock { seconds } => write!(f, "wall-clock ceiling of {seconds}s exceeded"),
        }
    }
}

/// Raw result of one executor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Process exit code (`None` when the process was killed).
    pub exit_code: Option<i64>,
    /// Captured stdout, already redacted.
    pub stdout: String,
    /// Captured stderr, already redacted.
    pub stderr: String,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Violation that terminated the run, if any.
    pub violation: Option<Violation>,
}

impl ExecResult {
    /// Ledger outcome for this result.
    pub fn outcome(&self) -> Outcome {
        match (&self.violation, self.exit_code) {
            (Some(_), _) => Outcome::PolicyViolation,
            (None, Some(0)) => Outcome::Success,
            (None, _) => Outcome::Failure,
        }
    }
}

/// Health status for a concrete executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Executor is operational.
    Healthy {
        /// Executor implementation kind.
        kind: ExecutorKind,
        /// Human-readable diagnostics.
        details: String,
    },
    /// Executor is not available.
    Unavailable {
        /// Executor implementation kind.
        kind: ExecutorKind,
        /// Human-readable diagnostics.
        details: String,
    },
}

impl HealthStatus {
    /// Returns `true` when the executor is in a healthy state.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// Errors produced by executor operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Infrastructure failure (daemon unreachable, container failed to
    /// start). Safe to retry and never flags the skill.
    #[error("sandbox fault: {0}")]
    SandboxFault(String),
    /// Execution is not permitted.
    #[error("execution is not allowed: {0}")]
    Forbidden(String),
    /// The request does not match the manifest.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Unified executor trait used by the runtime.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one request to completion or termination.
    async fn run(&self, request: &ExecRequest) -> Result<ExecResult, ExecutorError>;
    /// Check health for this executor instance.
    async fn health_check(&self) -> Result<HealthStatus, ExecutorError>;
    /// Host directory under which per-invocation output directories live.
    fn outputs_dir(&self) -> &Path;
    /// Configured resource ceilings.
    fn ceilings(&self) -> Limits;
    /// Returns concrete executor kind.
    fn kind(&self) -> ExecutorKind;
}

/// What the caller asked a skill to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillInput {
    /// Declared command name.
    pub command: String,
    /// Placeholder values.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl SkillInput {
    /// Input for a command with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add one placeholder value.
    #[must_use]
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Completed execution: the ledger record plus the captured output.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Record to append to the ledger.
    pub invocation: Invocation,
    /// Process exit code.
    pub exit_code: Option<i64>,
    /// Redacted stdout.
    pub stdout: String,
    /// Redacted stderr.
    pub stderr: String,
    /// Violation that terminated the run.
    pub violation: Option<Violation>,
}

/// `{name}` parameter syntax in command templates.
static PLACEHOLDER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}"));

/// Render a command template with shell-quoted placeholder values.
///
/// Substitution is a single pass over the template, so a value that itself
/// looks like `{name}` is quoted as data and never expanded.
///
/// # Errors
///
/// Returns [`ExecutorError::InvalidInput`] when a placeholder has no value or
/// an argument does not correspond to any placeholder.
pub fn render_command(
    spec: &CommandSpec,
    args: &BTreeMap<String, String>,
) -> Result<String, ExecutorError> {
    if let Some(unknown) = args.keys().find(|k| !spec.placeholders.contains(k)) {
        return Err(ExecutorError::InvalidInput(format!(
            "command '{}' has no parameter '{unknown}'",
            spec.name
        )));
    }
    if let Some(missing) = spec.placeholders.iter().find(|p| !args.contains_key(*p)) {
        return Err(ExecutorError::InvalidInput(format!(
            "command '{}' requires parameter '{missing}'",
            spec.name
        )));
    }
    let placeholder = PLACEHOLDER
        .as_ref()
        .map_err(|e| ExecutorError::InvalidInput(format!("placeholder pattern: {e}")))?;
    let rendered = placeholder.replace_all(&spec.template, |caps: &Captures<'_>| {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        caps.get(1)
            .and_then(|name| args.get(name.as_str()))
            .map_or_else(|| whole.to_owned(), |value| shell_quote(value))
    });
    Ok(rendered.into_owned())
}

/// Render and check a request without running it.
///
/// # Errors
///
/// Returns [`ExecutorError::InvalidInput`] for undeclared commands or bad
/// arguments.
pub fn prepare(
    skill: &Skill,
    input: &SkillInput,
    outputs_dir: &Path,
    ceilings: Limits,
) -> Result<ExecRequest, ExecutorError> {
    let spec = skill.manifest.command(&input.command).ok_or_else(|| {
        ExecutorError::InvalidInput(format!(
            "skill '{}' declares no command '{}'",
            skill.id, input.command
        ))
    })?;
    let command = render_command(spec, &input.args)?;
    let invocation_id = uuid::Uuid::new_v4().to_string();
    let profile = skill.profile();
    Ok(ExecRequest {
        output_dir: skill.output_dir(outputs_dir, &invocation_id),
        invocation_id,
        skill_id: skill.id.clone(),
        skill_root: skill.root.clone(),
        declared_output: PathBuf::from(&profile.output_dir),
        command,
        egress: profile.egress.clone(),
        dependencies: skill.manifest.dependencies.clone(),
        limits: ceilings.narrowed_by(&profile.limits),
    })
}

/// Run one skill command and produce its invocation record.
///
/// A rendered command that names a domain outside the allowlist is recorded
/// as a policy violation without launching anything.
///
/// # Errors
///
/// Returns [`ExecutorError::InvalidInput`] for undeclared commands and
/// [`ExecutorError::SandboxFault`] for infrastructure failures. Policy
/// violations are not errors; they come back as flagged invocations.
pub async fn execute(
    executor: &dyn Executor,
    skill: &Skill,
    input: &SkillInput,
    policy: &PolicyEngine,
) -> Result<Execution, ExecutorError> {
    let request = prepare(skill, input, executor.outputs_dir(), executor.ceilings())?;
    let kind = executor.kind();

    if let Some(domain) = policy.command_egress(&skill.id, &request.command) {
        warn!(
            skill = %skill.id,
            command = %input.command,
            domain = %domain,
            "pre-flight egress check failed, not launching"
        );
        let violation = Violation::Egress { domain };
        let result = ExecResult {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            violation: Some(violation),
        };
        return Ok(finish(&request, &input.command, kind, result));
    }

    std::fs::create_dir_all(&request.output_dir).map_err(|e| {
        ExecutorError::SandboxFault(format!(
            "failed to create output directory {}: {e}",
            request.output_dir.display()
        ))
    })?;

    let result = executor.run(&request).await?;
    let execution = finish(&request, &input.command, kind, result);

    match &execution.violation {
        Some(violation) => warn!(
            skill = %skill.id,
            command = %input.command,
            executor = %kind,
            violation = %violation,
            "invocation terminated by policy violation"
        ),
        None => info!(
            skill = %skill.id,
            command = %input.command,
            executor = %kind,
            outcome = %execution.invocation.outcome,
            duration_ms = execution.invocation.duration_ms,
            "invocation finished"
        ),
    }
    Ok(execution)
}

fn finish(request: &ExecRequest, command: &str, kind: ExecutorKind, result: ExecResult) -> Execution {
    let outcome = result.outcome();
    let invocation = Invocation {
        id: request.invocation_id.clone(),
        skill_id: request.skill_id.clone(),
        timestamp: Utc::now(),
        outcome,
        flagged: outcome == Outcome::PolicyViolation,
        duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        command: command.to_owned(),
        executor: kind,
        detail: result.violation.as_ref().map(ToString::to_string),
    };
    Execution {
        invocation,
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        violation: result.violation,
    }
}

/// Quote a value for POSIX `sh`.
pub fn shell_quote(raw: &str) -> String {
    let escaped = raw.replace('\'', r"'\''");
    format!("'{escaped}'")
}

/// Wrap a command so the shell applies the CPU time ceiling first.
///
/// The command runs in a child shell, so `RLIMIT_CPU` kills surface as exit
/// code [`monitor::SIGXCPU_EXIT`] from the wrapper.
pub(crate) fn wrap_with_cpu_limit(command: &str, cpu_seconds: u64) -> String {
    format!("ulimit -t {cpu_seconds}; sh -c {}", shell_quote(command))
}
