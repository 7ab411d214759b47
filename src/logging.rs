//! Log output for one-shot commands and the `serve` loop.
//!
//! Stdout carries command results, so every log line goes to stderr. `serve`
//! also keeps a JSON trail under the logs directory, one file per day, which
//! is where quarantines and approvals are reconstructed from after the fact.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset. Database and Docker client
/// chatter stays at `warn`.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,bollard=warn,hyper=warn,hyper_util=warn";

/// Trail files are named `skillgate.YYYY-MM-DD.jsonl`.
const TRAIL_PREFIX: &str = "skillgate";
const TRAIL_SUFFIX: &str = "jsonl";

/// Daily trail files kept before the oldest is removed.
const TRAIL_RETENTION_DAYS: usize = 30;

/// Keeps the trail writer alive; dropping it flushes pending lines.
pub struct LoggingGuard {
    _trail: WorkerGuard,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Daily-rotating JSON trail appender under `logs_dir`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or opened.
pub fn trail_appender(logs_dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(TRAIL_PREFIX)
        .filename_suffix(TRAIL_SUFFIX)
        .max_log_files(TRAIL_RETENTION_DAYS)
        .build(logs_dir)
        .with_context(|| format!("failed to open log trail in {}", logs_dir.display()))
}

/// Install the `serve` subscriber: the JSON trail plus compact stderr lines.
///
/// Both honour `RUST_LOG`.
///
/// # Errors
///
/// Returns an error if the trail cannot be opened or a global subscriber is
/// already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    let (trail, guard) = tracing_appender::non_blocking(trail_appender(logs_dir)?);

    let trail_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_writer(trail);
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter())
        .with(trail_layer)
        .with(console_layer)
        .try_init()
        .context("failed to install log subscriber")?;

    Ok(LoggingGuard { _trail: guard })
}

/// Install the stderr-only subscriber used by one-shot commands.
///
/// Lines carry no timestamp or target, and no colour when stderr is piped.
/// Installing twice is a no-op.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .try_init();
}
