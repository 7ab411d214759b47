//! Policy engine: egress allowlists and action risk classification.
//!
//! The engine holds the security profile of every registered skill and
//! answers two questions: may this skill talk to that domain, and how risky is
//! this action. Profiles are immutable for an audited source version, so
//! re-registering a skill replaces its profile wholesale.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::skill::{SecurityProfile, SkillId};

// ---------------------------------------------------------------------------
// Risk level and actions
// ---------------------------------------------------------------------------

/// Risk classification of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Routine action inside the declared surface.
    Low,
    /// Action that touches the network or a declared sensitive command.
    Medium,
    /// Action outside the declared surface or destructive.
    High,
}

impl RiskLevel {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("invalid risk level: {other:?}")),
        }
    }
}

/// An action a skill wants to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Execute a rendered shell command.
    RunCommand {
        /// Fully rendered command line.
        command: String,
    },
    /// Open a network connection.
    NetworkCall {
        /// Destination host name or IP literal.
        domain: String,
    },
    /// Write a file, path relative to the skill root.
    WriteFile {
        /// Target path.
        path: PathBuf,
    },
    /// Read a file, path relative to the skill root.
    ReadFile {
        /// Target path.
        path: PathBuf,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunCommand { command } => write!(f, "execute shell command `{command}`"),
            Self::NetworkCall { domain } => write!(f, "network call to {domain}"),
            Self::WriteFile { path } => write!(f, "write {}", path.display()),
            Self::ReadFile { path } => write!(f, "read {}", path.display()),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Destructive command shapes that are always classified High. Words are
/// matched on boundaries so arguments like `asphalt` stay harmless.
static DANGEROUS_COMMAND: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\brm\s+-[A-Za-z]*[rR][A-Za-z]*\s+(?:/|~)",
        r"|\bsudo\b",
        r"|\bmkfs(?:\.\w+)?\b",
        r"|\bdd\s+if=",
        r"|:\(\)\s*\{",
        r"|\bchmod\s+-R\s+777\s+/",
        r"|\b(?:shutdown|reboot|halt|poweroff)\b",
        r"|\binit\s+[06]\b",
        r"|\bnc\s+-e\b",
        r"|\|\s*(?:ba)?sh\b",
    ))
});

/// Host paths whose reads are High risk regardless of profile.
const SENSITIVE_READ_PREFIXES: &[&str] = &["/etc", "/proc", "/root", "/var/run", "/sys"];

/// Per-skill policy lookups.
///
/// Uses a sync [`RwLock`] since lookups never await.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    profiles: RwLock<HashMap<SkillId, Arc<SecurityProfile>>>,
    templates: RwLock<HashMap<SkillId, Vec<String>>>,
}

impl PolicyEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the profile and command templates for a skill.
    pub fn register(&self, skill_id: &SkillId, profile: SecurityProfile, templates: Vec<String>) {
        if let Ok(mut map) = self.profiles.write() {
            map.insert(skill_id.clone(), Arc::new(profile));
        }
        if let Ok(mut map) = self.templates.write() {
            map.insert(skill_id.clone(), templates);
        }
    }

    /// Remove a skill from the engine.
    pub fn unregister(&self, skill_id: &SkillId) {
        if let Ok(mut map) = self.profiles.write() {
            map.remove(skill_id);
        }
        if let Ok(mut map) = self.templates.write() {
            map.remove(skill_id);
        }
    }

    /// Profile registered for a skill.
    pub fn profile(&self, skill_id: &SkillId) -> Option<Arc<SecurityProfile>> {
        self.profiles
            .read()
            .ok()
            .and_then(|map| map.get(skill_id).cloned())
    }

    /// Whether `domain` is in the skill's declared egress allowlist.
    ///
    /// Unknown skills are never allowed any egress.
    pub fn is_allowed_egress(&self, skill_id: &SkillId, domain: &str) -> bool {
        self.profile(skill_id)
            .is_some_and(|profile| domain_allowed(&profile.egress, domain))
    }

    /// First domain referenced by a command that the skill may not contact.
    pub fn command_egress(&self, skill_id: &SkillId, command: &str) -> Option<String> {
        extract_hosts(command)
            .into_iter()
            .find(|host| !self.is_allowed_egress(skill_id, host))
    }

    /// Classify the risk of an action for a skill.
    ///
    /// Unknown skills classify every action as [`RiskLevel::High`].
    pub fn classify(&self, skill_id: &SkillId, action: &Action) -> RiskLevel {
        let Some(profile) = self.profile(skill_id) else {
            return RiskLevel::High;
        };
        match action {
            Action::RunCommand { command } => {
                let templates = self
                    .templates
                    .read()
                    .ok()
                    .and_then(|map| map.get(skill_id).cloned())
                    .unwrap_or_default();
                classify_command(&profile, &templates, command)
            }
            Action::NetworkCall { domain } => {
                if domain_allowed(&profile.egress, domain) {
                    RiskLevel::Low
                } else {
                    RiskLevel::High
                }
            }
            Action::WriteFile { path } => {
                if is_within(path, Path::new(&profile.output_dir)) {
                    RiskLevel::Low
                } else {
                    RiskLevel::High
                }
            }
            Action::ReadFile { path } => classify_read(path),
        }
    }

    /// Snapshot of every skill's allowlist, sorted by skill id.
    pub fn egress_table(&self) -> Vec<(SkillId, Vec<String>)> {
        let mut table: Vec<(SkillId, Vec<String>)> = self
            .profiles
            .read()
            .map(|map| {
                map.iter()
                    .map(|(id, profile)| (id.clone(), profile.egress.clone()))
                    .collect()
            })
            .unwrap_or_default();
        table.sort_by(|a, b| a.0.cmp(&b.0));
        table
    }
}

fn classify_command(profile: &SecurityProfile, templates: &[String], command: &str) -> RiskLevel {
    // An unusable pattern fails closed.
    if DANGEROUS_COMMAND
        .as_ref()
        .map_or(true, |pattern| pattern.is_match(command))
    {
        return RiskLevel::High;
    }

    let hosts = extract_hosts(command);
    if hosts.iter().any(|h| !domain_allowed(&profile.egress, h)) {
        return RiskLevel::High;
    }

    if !templates.iter().any(|t| template_matches(t, command)) {
        return RiskLevel::High;
    }

    let trimmed = command.trim_start();
    if profile
        .sensitive_commands
        .iter()
        .any(|prefix| trimmed.starts_with(prefix.as_str()))
    {
        return RiskLevel::Medium;
    }

    if !hosts.is_empty() {
        return RiskLevel::Medium;
    }

    RiskLevel::Low
}

fn classify_read(path: &Path) -> RiskLevel {
    if path.is_absolute() {
        let rendered = path.to_string_lossy();
        if SENSITIVE_READ_PREFIXES
            .iter()
            .any(|p| rendered.starts_with(p))
            || rendered.contains("/.ssh")
        {
            return RiskLevel::High;
        }
        return RiskLevel::Medium;
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

/// Whether a relative `path` stays inside relative directory `dir`.
fn is_within(path: &Path, dir: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth = depth.saturating_sub(1);
            }
            Component::Normal(_) => depth = depth.saturating_add(1),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    let normalized: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    normalized.starts_with(dir) && !normalized.components().any(|c| matches!(c, Component::ParentDir))
}

/// Whether a rendered command was produced from `template`.
fn template_matches(template: &str, command: &str) -> bool {
    let Ok(placeholder) = Regex::new(r"\{[A-Za-z_][A-Za-z0-9_]*\}") else {
        return false;
    };
    let mut pattern = String::from("^");
    let mut last = 0usize;
    for m in placeholder.find_iter(template) {
        pattern.push_str(&regex::escape(&template[last..m.start()]));
        pattern.push_str("(?s:.+?)");
        last = m.end();
    }
    pattern.push_str(&regex::escape(&template[last..]));
    pattern.push('$');
    Regex::new(&pattern).is_ok_and(|re| re.is_match(command.trim()))
}

// ---------------------------------------------------------------------------
// Domain helpers
// ---------------------------------------------------------------------------

/// Normalise a host for comparison: lowercase, no trailing dot, no port,
/// no IPv6 brackets.
pub fn normalize_host(raw: &str) -> String {
    let lowered = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if let Some(inner) = lowered.strip_prefix('[') {
        return inner.split(']').next().unwrap_or("").to_owned();
    }
    if lowered.parse::<IpAddr>().is_ok() {
        return lowered;
    }
    match lowered.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_owned(),
        _ => lowered,
    }
}

/// Whether `domain` matches any allowlist entry.
///
/// Host names match exactly or as a subdomain of an entry (`*.` prefixes are
/// accepted as an explicit subdomain marker). IP literals must match
/// exactly. A bare `*` entry matches nothing.
pub fn domain_allowed(allowlist: &[String], domain: &str) -> bool {
    let host = normalize_host(domain);
    if host.is_empty() {
        return false;
    }
    let is_ip = host.parse::<IpAddr>().is_ok();
    allowlist.iter().any(|entry| {
        let entry = normalize_host(entry);
        let entry = entry.strip_prefix("*.").unwrap_or(&entry);
        if entry.is_empty() || entry == "*" {
            return false;
        }
        if is_ip || entry.parse::<IpAddr>().is_ok() {
            return host == entry;
        }
        host == entry
            || host
                .strip_suffix(entry)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Extract the hosts of every URL in free text.
pub fn extract_hosts(text: &str) -> Vec<String> {
    let Ok(url_pattern) = Regex::new(r#"(?i)\b(?:https?|wss?|ftp)://[^\s'"`<>)\]}]+"#) else {
        return Vec::new();
    };
    let mut hosts: Vec<String> = Vec::new();
    for m in url_pattern.find_iter(text) {
        let Ok(parsed) = Url::parse(m.as_str()) else {
            continue;
        };
        if let Some(host) = parsed.host_str() {
            let host = normalize_host(host);
            if !host.is_empty() && !hosts.contains(&host) {
                hosts.push(host);
            }
        }
    }
    hosts
}

/// Check whether an IP address is in a private/reserved range.
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            // 127.0.0.0/8
            octets[0] == 127
            // 10.0.0.0/8
            || octets[0] == 10
            // 172.16.0.0/12
            || (octets[0] == 172 && (octets[1] & 0xF0) == 16)
            // 192.168.0.0/16
            || (octets[0] == 192 && octets[1] == 168)
            // 169.254.0.0/16 (link-local, cloud metadata)
            || (octets[0] == 169 && octets[1] == 254)
            // 100.64.0.0/10 (CGN)
            || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
            || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
            // fc00::/7
            || (segments[0] & 0xFE00) == 0xFC00
            // fe80::/10
            || (segments[0] & 0xFFC0) == 0xFE80
            || v6
                .to_ipv4_mapped()
                .is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
