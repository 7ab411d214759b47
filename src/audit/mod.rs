//! Static auditor ("smell test").
//!
//! The auditor reads a skill's manifest and source text and produces a
//! [`RiskReport`]. It never executes candidate code and is deterministic: the
//! same tree and manifest always yield the same ordered findings.
//!
//! Detection is heuristic. Each category lives in its own module:
//! - [`egress`]: URLs, IP literals, hostnames, direct network API usage
//! - [`filesystem`]: sensitive absolute paths, traversal, out-of-tree writes
//! - [`obfuscation`]: dynamic code execution, high-entropy literals, blobs

pub mod egress;
pub mod filesystem;
pub mod obfuscation;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::AuditConfig;
use crate::policy::RiskLevel;
use crate::skill::manifest::{load_manifest, ManifestLoadError, MANIFEST_FILE};
use crate::skill::{FileKind, Manifest, Skill, SkillId, SourceError, SourceTree};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Finding category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FindingCategory {
    /// Network contact outside the declared allowlist or interface.
    UnauthorizedEgress,
    /// Filesystem access outside the skill directory or output path.
    FilesystemEscape,
    /// Code that hides what it does.
    Obfuscation,
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UnauthorizedEgress => "unauthorized-egress",
            Self::FilesystemEscape => "filesystem-escape",
            Self::Obfuscation => "obfuscation",
        };
        f.pad(label)
    }
}

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Needs a human look.
    Medium,
    /// Forces quarantine.
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(RiskLevel::from(*self).as_str())
    }
}

impl From<Severity> for RiskLevel {
    fn from(value: Severity) -> Self {
        match value {
            Severity::Low => Self::Low,
            Severity::Medium => Self::Medium,
            Severity::High => Self::High,
        }
    }
}

/// Where a finding was observed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Path relative to the skill root.
    pub file: PathBuf,
    /// 1-based line, when the finding is line-specific.
    pub line: Option<usize>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}", self.file.display()),
            None => write!(f, "{}", self.file.display()),
        }
    }
}

/// One audit finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Category.
    pub category: FindingCategory,
    /// Severity.
    pub severity: Severity,
    /// Location in the source tree.
    pub location: Location,
    /// Human-readable description.
    pub description: String,
}

impl Finding {
    pub(crate) fn at(
        category: FindingCategory,
        severity: Severity,
        file: &Path,
        line: Option<usize>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            location: Location {
                file: file.to_path_buf(),
                line,
            },
            description: description.into(),
        }
    }
}

/// Aggregate label shown to the human reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityLabel {
    /// Nothing above Low.
    Secure,
    /// Highest finding is Medium.
    Warning,
    /// At least one High finding.
    Danger,
}

impl SecurityLabel {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Secure => "SECURE",
            Self::Warning => "WARNING",
            Self::Danger => "DANGER",
        }
    }
}

impl fmt::Display for SecurityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Immutable result of auditing one source version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskReport {
    /// Audited skill.
    pub skill_id: SkillId,
    /// Digest of the audited source tree.
    pub source_digest: String,
    /// Findings ordered by location, then category.
    pub findings: Vec<Finding>,
}

impl RiskReport {
    /// Maximum finding severity, `None` for a clean report.
    pub fn severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    /// Whether any finding is High.
    pub fn has_high(&self) -> bool {
        self.severity() == Some(Severity::High)
    }

    /// Reviewer-facing label.
    pub fn label(&self) -> SecurityLabel {
        match self.severity() {
            Some(Severity::High) => SecurityLabel::Danger,
            Some(Severity::Medium) => SecurityLabel::Warning,
            Some(Severity::Low) | None => SecurityLabel::Secure,
        }
    }

    /// Number of findings in a category.
    pub fn count(&self, category: FindingCategory) -> usize {
        self.findings
            .iter()
            .filter(|f| f.category == category)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that abort an audit. The skill stays `Unaudited`.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The manifest is missing or malformed.
    #[error("manifest parse error in {path}: {reason}")]
    ManifestParse {
        /// Manifest path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// The source tree could not be read.
    #[error("source access error: {0}")]
    SourceAccess(#[from] SourceError),
}

// ---------------------------------------------------------------------------
// Auditor
// ---------------------------------------------------------------------------

/// A skill loaded from disk together with its report.
#[derive(Debug, Clone)]
pub struct AuditedSkill {
    /// Loaded skill.
    pub skill: Skill,
    /// Report for the loaded source version.
    pub report: RiskReport,
}

/// Static auditor with compiled detectors.
#[derive(Debug)]
pub struct Auditor {
    config: AuditConfig,
    egress: egress::EgressDetector,
    filesystem: filesystem::FilesystemDetector,
    obfuscation: obfuscation::ObfuscationDetector,
}

impl Auditor {
    /// Build an auditor with the given thresholds.
    pub fn new(config: AuditConfig) -> Self {
        Self {
            egress: egress::EgressDetector::new(),
            filesystem: filesystem::FilesystemDetector::new(),
            obfuscation: obfuscation::ObfuscationDetector::new(&config),
            config,
        }
    }

    /// Thresholds in use.
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Audit a loaded tree against its manifest.
    pub fn audit(&self, tree: &SourceTree, manifest: &Manifest) -> RiskReport {
        let profile = &manifest.security;
        let mut findings = Vec::new();

        self.egress.scan_manifest(manifest, &mut findings);

        for (link, target) in tree.escaping_links() {
            findings.push(Finding::at(
                FindingCategory::FilesystemEscape,
                Severity::High,
                link,
                None,
                format!("symlink resolves outside the skill directory: {}", target.display()),
            ));
        }

        for file in tree.files() {
            match file.kind {
                FileKind::Text => {
                    self.egress.scan(file, profile, &mut findings);
                    self.filesystem.scan(file, profile, &mut findings);
                    self.obfuscation.scan(file, &mut findings);
                }
                FileKind::Binary => findings.push(Finding::at(
                    FindingCategory::Obfuscation,
                    Severity::Medium,
                    &file.path,
                    None,
                    "opaque binary artifact cannot be inspected",
                )),
                FileKind::Oversized => findings.push(Finding::at(
                    FindingCategory::Obfuscation,
                    Severity::Medium,
                    &file.path,
                    None,
                    format!(
                        "source file exceeds {} bytes and was not scanned",
                        self.config.max_file_bytes
                    ),
                )),
                FileKind::Other => {}
            }
        }

        findings.sort_by(|a, b| {
            a.location
                .cmp(&b.location)
                .then(a.category.cmp(&b.category))
                .then(b.severity.cmp(&a.severity))
                .then(a.description.cmp(&b.description))
        });
        findings.dedup();

        RiskReport {
            skill_id: manifest.id.clone(),
            source_digest: tree.digest().to_owned(),
            findings,
        }
    }

    /// Load a skill directory and audit it.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ManifestParse`] for a missing or malformed
    /// `SKILL.md` and [`AuditError::SourceAccess`] for unreadable files.
    pub fn audit_dir(&self, root: &Path) -> Result<AuditedSkill, AuditError> {
        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = load_manifest(root).map_err(|err| match err {
            ManifestLoadError::Io(e) if e.kind() != std::io::ErrorKind::NotFound => {
                AuditError::SourceAccess(SourceError::Access {
                    path: manifest_path.clone(),
                    source: e,
                })
            }
            other => AuditError::ManifestParse {
                path: manifest_path.clone(),
                reason: other.to_string(),
            },
        })?;

        // Run output is not source: keep it out of the scan and the digest.
        let output: PathBuf = Path::new(&manifest.security.output_dir)
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        let excluded = [output];
        let tree = SourceTree::load(
            root,
            &self.config.extensions,
            self.config.max_file_bytes,
            &excluded,
        )?;
        let report = self.audit(&tree, &manifest);
        let skill = Skill::new(manifest, &tree);
        Ok(AuditedSkill { skill, report })
    }
}

/// Whether a line is a comment in the common scripting languages.
pub(crate) fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#')
        || trimmed.starts_with("//")
        || trimmed.starts_with("--")
        || trimmed.starts_with("/*")
        || trimmed.starts_with("* ")
}
