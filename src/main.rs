//! skillgate CLI entry point.
//!
//! One-shot subcommands (`audit`, `install`, `run`, `status`, ...) log to
//! stderr; `serve` keeps the runtime loaded with file logging and the
//! approval pump running until interrupted.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use skillgate::approval::channel::{pump, ApprovalResponse};
use skillgate::approval::{ApprovalGateway, ConsoleChannel, Scope};
use skillgate::audit::{Auditor, RiskReport};
use skillgate::config::{self, Config, RuntimePaths};
use skillgate::executor::docker::DockerSandbox;
use skillgate::executor::host::HostExecutor;
use skillgate::executor::redactor::Redactor;
use skillgate::executor::{
    ExecRequest, ExecResult, Executor, ExecutorError, ExecutorKind, HealthStatus, Limits,
    SkillInput,
};
use skillgate::ledger::TrustLedger;
use skillgate::logging;
use skillgate::runtime::SkillRuntime;
use skillgate::skill::SkillId;

/// Sandboxed trust lifecycle for third-party agent skills.
#[derive(Parser)]
#[command(name = "skillgate", version, about)]
struct Cli {
    /// Config directory (defaults to `~/.skillgate`).
    #[arg(long, global = true, env = "SKILLGATE_HOME")]
    home: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create the directory layout and a default config.toml.
    Init,
    /// Audit a skill directory without installing it.
    Audit {
        /// Skill directory containing SKILL.md.
        path: PathBuf,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Audit and install a skill.
    Install {
        /// Skill directory containing SKILL.md.
        path: PathBuf,
    },
    /// Run a declared command of an installed skill.
    Run {
        /// Skill identifier.
        skill: String,
        /// Declared command name.
        command: String,
        /// Placeholder value, `key=value`. Repeatable.
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
        /// Requesting user (lease scope).
        #[arg(long)]
        user: Option<String>,
        /// Project (lease scope).
        #[arg(long, default_value = "default")]
        project: String,
    },
    /// Show trust state of one or all skills.
    Status {
        /// Skill identifier; all skills when omitted.
        skill: Option<String>,
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show the invocation log of a skill.
    History {
        /// Skill identifier.
        skill: String,
        /// Maximum entries, newest first.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Release a quarantined skill after manual review.
    Review {
        /// Skill identifier.
        skill: String,
        /// Reviewer identity.
        #[arg(long)]
        reviewer: String,
        /// Review note.
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Request promotion of a skill to host execution.
    Promote {
        /// Skill identifier.
        skill: String,
        /// Requesting user.
        #[arg(long)]
        user: Option<String>,
        /// Project scope.
        #[arg(long, default_value = "default")]
        project: String,
    },
    /// Re-audit an installed skill from its source directory.
    Reaudit {
        /// Skill identifier.
        skill: String,
    },
    /// Load installed skills and keep the approval pump running.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let home = match cli.home {
        Some(home) => home,
        None => config::config_dir()?,
    };

    match cli.command {
        Command::Init => handle_init(&home),
        Command::Audit { path, json } => handle_audit(&home, &path, json),
        Command::Install { path } => handle_install(&home, &path).await,
        Command::Run {
            skill,
            command,
            args,
            user,
            project,
        } => {
            let mut input = SkillInput::new(command);
            for (key, value) in args {
                input = input.arg(key, value);
            }
            handle_run(&home, &skill, input, &scope(user, project)).await
        }
        Command::Status { skill, json } => handle_status(&home, skill.as_deref(), json).await,
        Command::History { skill, limit } => handle_history(&home, &skill, limit).await,
        Command::Review {
            skill,
            reviewer,
            note,
        } => handle_review(&home, &skill, &reviewer, &note).await,
        Command::Promote {
            skill,
            user,
            project,
        } => handle_promote(&home, &skill, &scope(user, project)).await,
        Command::Reaudit { skill } => handle_reaudit(&home, &skill).await,
        Command::Serve => handle_serve(&home).await,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn handle_init(home: &Path) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, paths) = load(home)?;
    paths.ensure()?;
    if !paths.config_file.exists() {
        let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
        std::fs::write(&paths.config_file, rendered)
            .with_context(|| format!("failed to write {}", paths.config_file.display()))?;
    }
    println!("initialised {}", paths.root.display());
    Ok(())
}

fn handle_audit(home: &Path, path: &Path, json: bool) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, _) = load(home)?;
    let audited = Auditor::new(config.audit).audit_dir(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&audited.report)?);
    } else {
        print_report(&audited.report);
    }
    if audited.report.has_high() {
        std::process::exit(2);
    }
    Ok(())
}

async fn handle_install(home: &Path, path: &Path) -> anyhow::Result<()> {
    logging::init_cli();
    let (runtime, _) = build_runtime(home).await?;
    let installed = runtime.install(path, &operator()).await?;
    print_report(&installed.report);
    println!("{} is {}", installed.record.id, installed.record.state);
    Ok(())
}

async fn handle_run(
    home: &Path,
    skill: &str,
    input: SkillInput,
    scope: &Scope,
) -> anyhow::Result<()> {
    logging::init_cli();
    let skill_id = parse_skill(skill)?;
    let (runtime, _) = build_runtime(home).await?;
    let outcome = runtime.run(&skill_id, &input, scope).await?;

    let execution = &outcome.execution;
    print!("{}", execution.stdout);
    eprint!("{}", execution.stderr);
    if let Some(violation) = &execution.violation {
        eprintln!("policy violation: {violation}");
    }
    eprintln!(
        "{} {} ({} ms) on {}; {} is {} with {} clean runs",
        execution.invocation.command,
        execution.invocation.outcome,
        execution.invocation.duration_ms,
        execution.invocation.executor,
        outcome.record.id,
        outcome.record.state,
        outcome.record.clean_runs
    );
    match execution.exit_code {
        Some(0) => Ok(()),
        _ => std::process::exit(1),
    }
}

async fn handle_status(home: &Path, skill: Option<&str>, json: bool) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, paths) = load(home)?;
    let ledger = open_ledger(&config, &paths).await?;
    let records = match skill {
        Some(skill) => vec![ledger.require(&parse_skill(skill)?).await?],
        None => ledger.records().await?,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("no skills installed");
    }
    for record in records {
        let label = ledger
            .latest_report(&record.id)
            .await?
            .map_or_else(|| "-".to_owned(), |r| r.label().to_string());
        println!(
            "{:<32} {:<18} {:>5}/{:<5} {:<8} epoch {}",
            record.id,
            record.state,
            record.clean_runs,
            ledger.promotion_threshold(),
            label,
            record.epoch
        );
    }
    Ok(())
}

async fn handle_history(home: &Path, skill: &str, limit: usize) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, paths) = load(home)?;
    let ledger = open_ledger(&config, &paths).await?;
    for entry in ledger.history(&parse_skill(skill)?, limit).await? {
        let inv = entry.invocation;
        println!(
            "{} e{} {:<16} {:<16} {:>7} ms {:<7} {}{}",
            inv.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.epoch,
            inv.command,
            inv.outcome,
            inv.duration_ms,
            inv.executor,
            if inv.flagged { "FLAGGED " } else { "" },
            inv.detail.unwrap_or_default()
        );
    }
    Ok(())
}

async fn handle_review(home: &Path, skill: &str, reviewer: &str, note: &str) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, paths) = load(home)?;
    let ledger = open_ledger(&config, &paths).await?;
    let skill_id = parse_skill(skill)?;
    let guard = ledger.acquire(&skill_id).await;
    let record = ledger.manual_review(&guard, reviewer, note).await?;
    println!("{} is {}", record.id, record.state);
    Ok(())
}

async fn handle_promote(home: &Path, skill: &str, scope: &Scope) -> anyhow::Result<()> {
    logging::init_cli();
    let skill_id = parse_skill(skill)?;
    let (runtime, _) = build_runtime(home).await?;
    let record = runtime.request_promotion(&skill_id, scope).await?;
    println!("{} is {}", record.id, record.state);
    Ok(())
}

async fn handle_reaudit(home: &Path, skill: &str) -> anyhow::Result<()> {
    logging::init_cli();
    let skill_id = parse_skill(skill)?;
    let (runtime, _) = build_runtime(home).await?;
    let installed = runtime.reaudit(&skill_id, &operator()).await?;
    print_report(&installed.report);
    println!("{} is {}", installed.record.id, installed.record.state);
    Ok(())
}

async fn handle_serve(home: &Path) -> anyhow::Result<()> {
    let (config, paths) = load(home)?;
    paths.ensure()?;
    let _logging_guard = logging::init_production(&paths.logs_dir)?;

    let (runtime, sandbox) = build_runtime(home).await?;
    let loaded = runtime.load_installed().await?;

    let mut installed: usize = 0;
    if let Ok(entries) = std::fs::read_dir(&paths.skills_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.join(skillgate::skill::manifest::MANIFEST_FILE).is_file() {
                continue;
            }
            match runtime.install(&path, "system").await {
                Ok(_) => installed = installed.saturating_add(1),
                Err(e) => warn!(path = %path.display(), error = %e, "skill install failed"),
            }
        }
    }

    if let Some(sandbox) = &sandbox {
        match sandbox.health_check().await {
            Ok(status) if status.is_healthy() => {}
            Ok(status) => warn!(?status, "sandbox executor unhealthy"),
            Err(e) => warn!(error = %e, "sandbox health check failed"),
        }
        let table = runtime.policy().egress_table().into_iter().collect();
        if let Err(e) = sandbox.sync_egress(table).await {
            warn!(error = %e, "egress proxy not started; skills with egress will retry on run");
        }
    }

    info!(
        home = %paths.root.display(),
        loaded,
        installed,
        max_concurrent = config.sandbox.max_concurrent,
        "skillgate serving"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    if let Some(sandbox) = sandbox {
        sandbox.shutdown().await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn load(home: &Path) -> anyhow::Result<(Config, RuntimePaths)> {
    let config_file = home.join("config.toml");
    let config = config::load_or_default(&config_file)?;
    let paths = RuntimePaths::resolve(home, &config.paths);
    Ok((config, paths))
}

async fn open_ledger(config: &Config, paths: &RuntimePaths) -> anyhow::Result<TrustLedger> {
    TrustLedger::open(&paths.ledger_db, config.trust.promotion_threshold)
        .await
        .with_context(|| format!("failed to open ledger at {}", paths.ledger_db.display()))
}

/// Build the runtime with the console approval channel.
///
/// Returns the Docker sandbox separately when the daemon is reachable.
async fn build_runtime(
    home: &Path,
) -> anyhow::Result<(SkillRuntime, Option<Arc<DockerSandbox>>)> {
    let (config, paths) = load(home)?;
    paths.ensure()?;
    let ledger = Arc::new(open_ledger(&config, &paths).await?);

    let (tx, rx) = mpsc::channel::<ApprovalResponse>(16);
    let gateway = Arc::new(ApprovalGateway::new(
        Arc::new(ConsoleChannel),
        config.approval.clone(),
    ));
    tokio::spawn(pump(Arc::clone(&gateway), rx));
    ConsoleChannel::spawn_reader(operator(), tx);

    let redactor = Redactor::from_host_env();
    let (sandbox, docker): (Arc<dyn Executor>, Option<Arc<DockerSandbox>>) =
        match DockerSandbox::new(&config.sandbox, &paths, redactor.clone()).await {
            Ok(sandbox) => {
                let sandbox = Arc::new(sandbox);
                (Arc::clone(&sandbox) as Arc<dyn Executor>, Some(sandbox))
            }
            Err(e) => {
                warn!(error = %e, "docker unavailable; sandboxed runs will fail");
                let offline = Unreachable {
                    reason: e.to_string(),
                    limits: Limits::from_config(&config.sandbox),
                    outputs_dir: paths.outputs_dir.clone(),
                };
                (Arc::new(offline), None)
            }
        };
    let host: Arc<dyn Executor> = Arc::new(HostExecutor::new(&config.sandbox, &paths, redactor));

    let runtime = SkillRuntime::new(config, ledger, gateway, sandbox, host);
    runtime.restore_leases().await?;
    Ok((runtime, docker))
}

/// Stand-in sandbox when the Docker daemon cannot be reached.
struct Unreachable {
    reason: String,
    limits: Limits,
    outputs_dir: PathBuf,
}

#[async_trait::async_trait]
impl Executor for Unreachable {
    async fn run(&self, _request: &ExecRequest) -> Result<ExecResult, ExecutorError> {
        Err(ExecutorError::SandboxFault(self.reason.clone()))
    }

    async fn health_check(&self) -> Result<HealthStatus, ExecutorError> {
        Ok(HealthStatus::Unavailable {
            kind: ExecutorKind::Sandbox,
            details: self.reason.clone(),
        })
    }

    fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    fn ceilings(&self) -> Limits {
        self.limits
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Sandbox
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_skill(raw: &str) -> anyhow::Result<SkillId> {
    SkillId::parse(raw).map_err(|e| anyhow::anyhow!(e))
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

fn operator() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_owned())
}

fn scope(user: Option<String>, project: String) -> Scope {
    Scope::new(user.unwrap_or_else(operator), project)
}

fn print_report(report: &RiskReport) {
    println!(
        "{} [{}] {} finding(s), digest {}",
        report.skill_id,
        report.label(),
        report.findings.len(),
        report.source_digest.get(..12).unwrap_or(&report.source_digest)
    );
    for finding in &report.findings {
        println!(
            "  {:<6} {:<20} {} {}",
            finding.severity, finding.category, finding.location, finding.description
        );
    }
}
