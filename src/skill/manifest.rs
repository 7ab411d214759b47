//! `SKILL.md` manifest parsing.
//!
//! A manifest is a markdown file with YAML front matter:
//!
//! ```text
//! ---
//! name: arxiv-search
//! dependencies: [python]
//! security:
//!   egress: [export.arxiv.org]
//!   limits: { cpu_seconds: 30, memory_mb: 256, timeout_secs: 60 }
//! ---
//! ## Commands
//! - search: `python search.py {query}`
//! ```
//!
//! The security profile it declares is immutable for the audited source
//! version and feeds both the policy engine and the sandbox.

use std::collections::HashSet;
use std::path::{Component, Path};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::SkillId;

/// File name of the manifest inside a skill directory.
pub const MANIFEST_FILE: &str = "SKILL.md";

/// Errors raised while parsing a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The manifest does not start with a `---` delimited front matter block.
    #[error("missing YAML front matter")]
    MissingFrontMatter,
    /// The front matter is not valid YAML for the manifest schema.
    #[error("invalid front matter: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// A field is present but semantically invalid.
    #[error("invalid manifest field `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Per-skill resource ceilings requested by the manifest.
///
/// Unset values fall back to the sandbox defaults from configuration, and
/// requested values are clamped to the configured ceilings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in seconds (`RLIMIT_CPU`).
    #[serde(default)]
    pub cpu_seconds: Option<u64>,
    /// Memory limit in megabytes.
    #[serde(default)]
    pub memory_mb: Option<u32>,
    /// Wall-clock timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Security profile declared in the manifest `security` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProfile {
    /// Domains and IP addresses the skill may contact.
    #[serde(default)]
    pub egress: Vec<String>,
    /// Source files allowed to call network APIs directly.
    #[serde(default)]
    pub egress_wrappers: Vec<String>,
    /// Relative directory the skill writes its output to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Resource ceilings.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Command prefixes that always need human approval.
    #[serde(default)]
    pub sensitive_commands: Vec<String>,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            egress: Vec::new(),
            egress_wrappers: Vec::new(),
            output_dir: default_output_dir(),
            limits: ResourceLimits::default(),
            sensitive_commands: Vec::new(),
        }
    }
}

fn default_output_dir() -> String {
    "output".to_owned()
}

/// A command declared in the `## Commands` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Name used to invoke the command.
    pub name: String,
    /// Shell template with `{placeholder}` parameters.
    pub template: String,
    /// Placeholder names in order of first appearance.
    pub placeholders: Vec<String>,
    /// 1-based line of the declaration inside `SKILL.md`.
    pub line: usize,
}

/// Parsed `SKILL.md`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Skill identifier.
    pub id: SkillId,
    /// Free-form description.
    pub description: Option<String>,
    /// Declared version string.
    pub version: Option<String>,
    /// Runtime dependencies (drive base image selection).
    pub dependencies: Vec<String>,
    /// Declared commands.
    pub commands: Vec<CommandSpec>,
    /// Declared security profile.
    pub security: SecurityProfile,
}

impl Manifest {
    /// Look up a declared command by name.
    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct FrontMatter {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    security: SecurityProfile,
}

/// Read and parse `SKILL.md` from a skill directory.
///
/// # Errors
///
/// Returns [`ManifestLoadError::Io`] when the file cannot be read and
/// [`ManifestLoadError::Parse`] when it is malformed.
pub fn load_manifest(skill_root: &Path) -> Result<Manifest, ManifestLoadError> {
    let path = skill_root.join(MANIFEST_FILE);
    let text = std::fs::read_to_string(&path).map_err(ManifestLoadError::Io)?;
    parse_manifest(&text).map_err(ManifestLoadError::Parse)
}

/// Failure to load a manifest from disk.
#[derive(Debug, thiserror::Error)]
pub enum ManifestLoadError {
    /// The file could not be read.
    #[error("cannot read {MANIFEST_FILE}: {0}")]
    Io(std::io::Error),
    /// The file was read but is malformed.
    #[error(transparent)]
    Parse(ManifestError),
}

/// Parse manifest text.
///
/// # Errors
///
/// Returns [`ManifestError`] when the front matter is missing or invalid, or
/// when the declared profile contains unsafe values.
pub fn parse_manifest(text: &str) -> Result<Manifest, ManifestError> {
    let (front, body, body_offset) = split_front_matter(text)?;
    let raw: FrontMatter = serde_yaml::from_str(front)?;

    let id = SkillId::parse(raw.name.trim()).map_err(|reason| ManifestError::Invalid {
        field: "name",
        reason,
    })?;

    let mut security = raw.security;
    security.egress = security
        .egress
        .iter()
        .map(|entry| entry.trim().trim_end_matches('.').to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect();
    validate_relative("security.output_dir", &security.output_dir)?;
    if !Path::new(&security.output_dir)
        .components()
        .any(|c| matches!(c, Component::Normal(_)))
    {
        return Err(ManifestError::Invalid {
            field: "security.output_dir",
            reason: format!("'{}' must name a subdirectory", security.output_dir),
        });
    }
    for wrapper in &security.egress_wrappers {
        validate_relative("security.egress_wrappers", wrapper)?;
    }

    let commands = parse_commands(body, body_offset)?;

    Ok(Manifest {
        id,
        description: raw.description,
        version: raw.version,
        dependencies: raw.dependencies,
        commands,
        security,
    })
}

/// Split `---` front matter from the markdown body.
///
/// Returns the front matter, the body, and the 0-based line index where the
/// body starts.
fn split_front_matter(text: &str) -> Result<(&str, &str, usize), ManifestError> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
        .ok_or(ManifestError::MissingFrontMatter)?;

    let mut offset = 0usize;
    for (index, line) in rest.split_inclusive('\n').enumerate() {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body_start = offset.saturating_add(line.len());
            let body = rest.get(body_start..).unwrap_or("");
            // +2: opening delimiter line and closing delimiter line.
            return Ok((front, body, index.saturating_add(2)));
        }
        offset = offset.saturating_add(line.len());
    }
    Err(ManifestError::MissingFrontMatter)
}

fn validate_relative(field: &'static str, value: &str) -> Result<(), ManifestError> {
    let path = Path::new(value);
    if value.trim().is_empty() || path.is_absolute() {
        return Err(ManifestError::Invalid {
            field,
            reason: format!("'{value}' must be a non-empty relative path"),
        });
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(ManifestError::Invalid {
            field,
            reason: format!("'{value}' must stay inside the skill directory"),
        });
    }
    Ok(())
}

fn parse_commands(body: &str, body_offset: usize) -> Result<Vec<CommandSpec>, ManifestError> {
    let heading = compile(r"^##\s+Commands\s*$")?;
    let item = compile(r"^\s*[-*]\s+(?:`?([A-Za-z0-9_-]+)`?:\s+)?`([^`]+)`")?;
    let placeholder = compile(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")?;

    let mut commands: Vec<CommandSpec> = Vec::new();
    let mut in_section = false;
    let mut taken: HashSet<String> = HashSet::new();

    for (index, line) in body.lines().enumerate() {
        if line.starts_with("## ") || line.starts_with("##\t") {
            in_section = heading.is_match(line);
            continue;
        }
        if !in_section {
            continue;
        }
        let Some(caps) = item.captures(line) else {
            continue;
        };
        let template = caps
            .get(2)
            .map(|m| m.as_str().trim().to_owned())
            .unwrap_or_default();
        if template.is_empty() {
            continue;
        }

        let mut name = match caps.get(1) {
            Some(explicit) => explicit.as_str().to_owned(),
            None => derive_command_name(&template),
        };
        if taken.contains(&name) {
            name = format!("{name}_{}", short_hash(&template));
        }
        if !taken.insert(name.clone()) {
            return Err(ManifestError::Invalid {
                field: "commands",
                reason: format!("duplicate command '{name}'"),
            });
        }

        let mut placeholders: Vec<String> = Vec::new();
        for cap in placeholder.captures_iter(&template) {
            if let Some(p) = cap.get(1) {
                let p = p.as_str().to_owned();
                if !placeholders.contains(&p) {
                    placeholders.push(p);
                }
            }
        }

        commands.push(CommandSpec {
            name,
            template,
            placeholders,
            line: body_offset.saturating_add(index).saturating_add(1),
        });
    }

    Ok(commands)
}

fn derive_command_name(template: &str) -> String {
    let first = template.split_whitespace().next().unwrap_or("command");
    let base = Path::new(first)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(first);
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "command".to_owned()
    } else {
        sanitized
    }
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest).chars().take(6).collect()
}

fn compile(pattern: &str) -> Result<Regex, ManifestError> {
    Regex::new(pattern).map_err(|e| ManifestError::Invalid {
        field: "commands",
        reason: e.to_string(),
    })
}
