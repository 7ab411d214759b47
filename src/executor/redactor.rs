//! Secret redaction for skill output.
//!
//! Skill output is untrusted and may echo credentials it found or was
//! handed. Everything an executor returns passes through here before it is
//! logged, stored or shown.

use regex::Regex;

/// Canonical replacement marker for redacted content.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Environment variable name fragments that mark a value as secret.
const SECRET_ENV_HINTS: &[&str] = &["KEY", "TOKEN", "SECRET", "PASSWORD", "CREDENTIAL"];

/// Values shorter than this are never treated as exact secrets.
const MIN_SECRET_LEN: usize = 8;

/// Redacts known secret values and token-like patterns from output text.
#[derive(Debug, Clone)]
pub struct Redactor {
    exact_secrets: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Create a redactor from known secret values.
    pub fn new(exact_secrets: Vec<String>) -> Self {
        let mut exact_secrets: Vec<String> = exact_secrets
            .into_iter()
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        // Longest first, so a secret containing another is replaced whole.
        exact_secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self {
            exact_secrets,
            patterns: default_patterns(),
        }
    }

    /// Redactor seeded with the values of secret-looking host env vars.
    pub fn from_host_env() -> Self {
        let secrets = std::env::vars()
            .filter(|(name, _)| {
                let upper = name.to_ascii_uppercase();
                SECRET_ENV_HINTS.iter().any(|hint| upper.contains(hint))
            })
            .map(|(_, value)| value)
            .collect();
        Self::new(secrets)
    }

    /// Redact exact known secrets and known secret patterns.
    pub fn redact(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for secret in &self.exact_secrets {
            sanitized = sanitized.replace(secret, REDACTION_MARKER);
        }
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, REDACTION_MARKER)
                .to_string();
        }
        sanitized
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"github_pat_[A-Za-z0-9_]{20,}",
        r"glpat-[A-Za-z0-9_\-]{16,}",
        r"xox[bpa]-[A-Za-z0-9\-]{20,}",
        r"AKIA[0-9A-Z]{16}",
        r"(?i)bearer\s+[A-Za-z0-9._\-]{20,}",
        r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
    ];

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}
