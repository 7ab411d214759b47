//! Violation detection helpers shared by the executors.
//!
//! Everything here is pure (or reads the filesystem only) so it can be
//! tested without a Docker daemon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{Limits, Violation};
use crate::policy::normalize_host;

/// Exit status of a shell whose child was killed by `SIGXCPU`.
pub const SIGXCPU_EXIT: i64 = 152;

/// Marker the kernel error message carries for writes to a read-only mount.
const READ_ONLY_MARKER: &str = "Read-only file system";

/// Decide which ceiling, if any, a finished process breached.
pub fn classify_exit(
    exit_code: Option<i64>,
    oom_killed: bool,
    stderr: &str,
    limits: &Limits,
) -> Option<Violation> {
    if oom_killed {
        return Some(Violation::MemoryCeiling {
            megabytes: limits.memory_mb,
        });
    }
    if exit_code == Some(SIGXCPU_EXIT) {
        return Some(Violation::CpuCeiling {
            seconds: limits.cpu_seconds,
        });
    }
    read_only_write(stderr).map(|path| Violation::FilesystemWrite { path })
}

/// Path of the first write rejected by a read-only mount, if any.
///
/// Returns `Some(None)` when the failure is present but the path could not
/// be extracted.
pub fn read_only_write(stderr: &str) -> Option<Option<String>> {
    let line = stderr.lines().find(|l| l.contains(READ_ONLY_MARKER))?;
    let path = line
        .split(READ_ONLY_MARKER)
        .flat_map(|part| part.split(['\'', '"', ' ', ':']))
        .find(|token| token.starts_with('/'))
        .map(ToOwned::to_owned);
    Some(path)
}

/// One denied request reported by the egress proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    /// Unix timestamp with millisecond precision.
    pub timestamp: f64,
    /// Proxy port the request arrived on.
    pub port: u16,
    /// Requested host.
    pub host: String,
}

/// Parse one proxy access log line.
///
/// The expected format is `%ts.%03tu %>a %>lp %Ss/%03>Hs %rm %ru`. Only
/// `TCP_DENIED` lines produce a [`Denial`].
pub fn parse_denial(line: &str) -> Option<Denial> {
    let mut fields = line.split_whitespace();
    let timestamp = fields.next()?.parse::<f64>().ok()?;
    let _client = fields.next()?;
    let port = fields.next()?.parse::<u16>().ok()?;
    let status = fields.next()?;
    if !status.starts_with("TCP_DENIED") {
        return None;
    }
    let _method = fields.next()?;
    let target = fields.next()?;
    let host = request_host(target)?;
    Some(Denial {
        timestamp,
        port,
        host,
    })
}

fn request_host(target: &str) -> Option<String> {
    if target.contains("://") {
        let parsed = url::Url::parse(target).ok()?;
        return parsed.host_str().map(normalize_host);
    }
    // CONNECT targets are `host:port`.
    let host = normalize_host(target);
    (!host.is_empty()).then_some(host)
}

/// Size and modification time of a watched file; `None` marks a directory
/// whose presence (but not contents) is watched.
type Stamp = Option<(u64, Option<SystemTime>)>;

/// Snapshot of the host paths a process must not write to.
///
/// Keys are absolute paths. A fingerprint is built from a recursive capture
/// of the skill tree plus shallow captures of the directories around it, and
/// compared after the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirFingerprint(BTreeMap<PathBuf, Stamp>);

impl DirFingerprint {
    /// Walk `root` recursively, skipping the subtree `exclude` (relative to
    /// `root`).
    ///
    /// Unreadable entries are skipped; the fingerprint is a best-effort
    /// change detector, not an integrity check.
    pub fn capture(root: &Path, exclude: &Path) -> Self {
        let excluded = root.join(exclude);
        let mut entries = BTreeMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(read) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in read.flatten() {
                let path = entry.path();
                if path.starts_with(&excluded) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path);
                } else {
                    entries.insert(path, Some((meta.len(), meta.modified().ok())));
                }
            }
        }
        Self(entries)
    }

    /// Record the direct entries of `dir`, except `skip`.
    ///
    /// Files keep size and mtime; subdirectories only their presence, so
    /// activity inside a sibling directory is not attributed to this run.
    pub fn capture_entries(dir: &Path, skip: &Path) -> Self {
        let mut entries = BTreeMap::new();
        if let Ok(read) = std::fs::read_dir(dir) {
            for entry in read.flatten() {
                let path = entry.path();
                if path == skip {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let stamp = (!meta.is_dir()).then(|| (meta.len(), meta.modified().ok()));
                entries.insert(path, stamp);
            }
        }
        Self(entries)
    }

    /// Merge another capture into this one.
    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Number of watched paths.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First path that was added, removed or modified between two captures.
    pub fn first_change(&self, after: &Self) -> Option<PathBuf> {
        for (path, before) in &self.0 {
            match after.0.get(path) {
                Some(now) if now == before => {}
                _ => return Some(path.clone()),
            }
        }
        after
            .0
            .keys()
            .find(|path| !self.0.contains_key(*path))
            .cloned()
    }
}
