//! Skill identity, manifest and source tree.
//!
//! A [`Skill`] is an immutable snapshot of one audited source version: the
//! parsed `SKILL.md` manifest plus the digest of every file under the skill
//! root. Lifecycle state is not stored here; the trust ledger owns it.

pub mod manifest;
pub mod source;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use self::manifest::{CommandSpec, Manifest, ManifestError, ResourceLimits, SecurityProfile};
pub use self::source::{FileKind, SourceError, SourceFile, SourceTree};

/// Maximum length of a skill identifier.
const MAX_SKILL_ID_LEN: usize = 64;

/// Validated skill identifier (`[a-z0-9_-]{1,64}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SkillId(String);

impl SkillId {
    /// Parse and validate a skill identifier.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the id is empty, too long, or
    /// contains characters outside `[a-z0-9_-]`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("skill id is empty".to_owned());
        }
        if raw.len() > MAX_SKILL_ID_LEN {
            return Err(format!(
                "skill id '{raw}' exceeds {MAX_SKILL_ID_LEN} characters"
            ));
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(format!(
                "skill id '{raw}' must contain only lowercase letters, digits, '-' or '_'"
            ));
        }
        Ok(Self(raw.to_owned()))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SkillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl TryFrom<String> for SkillId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SkillId> for String {
    fn from(value: SkillId) -> Self {
        value.0
    }
}

/// One installed skill at a specific source version.
#[derive(Debug, Clone)]
pub struct Skill {
    /// Identifier taken from the manifest `name`.
    pub id: SkillId,
    /// Absolute path of the skill directory on the host.
    pub root: PathBuf,
    /// Parsed manifest.
    pub manifest: Manifest,
    /// SHA-256 digest of the full source tree.
    pub source_digest: String,
}

impl Skill {
    /// Build a skill from an already loaded manifest and source tree.
    pub fn new(manifest: Manifest, tree: &SourceTree) -> Self {
        Self {
            id: manifest.id.clone(),
            root: tree.root().to_path_buf(),
            manifest,
            source_digest: tree.digest().to_owned(),
        }
    }

    /// Security profile declared by the manifest.
    pub fn profile(&self) -> &SecurityProfile {
        &self.manifest.security
    }

    /// Host directory that receives this skill's output for one invocation.
    pub fn output_dir(&self, outputs_root: &Path, invocation: &str) -> PathBuf {
        outputs_root.join(self.id.as_str()).join(invocation)
    }
}
