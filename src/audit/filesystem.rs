//! Filesystem escape detection.

use std::path::{Component, Path};

use regex::Regex;

use super::{is_comment, Finding, FindingCategory, Severity};
use crate::skill::{SecurityProfile, SourceFile};

/// Mount point of the writable output directory inside the sandbox.
pub const SANDBOX_OUTPUT_MOUNT: &str = "/output";

/// Line patterns that reference locations outside the skill directory.
const ESCAPE_PATTERNS: &[(&str, Severity, &str)] = &[
    (
        r#"(?:^|[\s'"`(=,])/(?:etc|proc|sys|root|boot|dev|var/log|var/run|var/lib)(?:/|\b)"#,
        Severity::High,
        "reference to system path",
    ),
    (r"(?i)\.(?:ssh|aws|gnupg|kube|docker)/", Severity::High, "reference to credential directory"),
    (r"(?i)C:\\+Windows|\bSystem32\b", Severity::High, "reference to Windows system directory"),
    (r"(?:^|[\s'\x22`(=])~/", Severity::Medium, "reference to home directory"),
    (r"\$HOME\b|%USERPROFILE%|\bexpanduser\s*\(|\bos\.homedir\s*\(|\bPath\.home\s*\(|\bhome_dir\s*\(", Severity::Medium, "home directory lookup"),
    (r#"(?:^|[\s'"`(=])/home/[A-Za-z0-9_.-]+"#, Severity::Medium, "reference to a user home"),
    (r"\.\./|\.\.\\", Severity::Medium, "parent-directory traversal"),
];

/// Write calls whose first string argument is the target path.
const WRITE_PATTERNS: &[&str] = &[
    r#"\bopen\s*\(\s*[rbf]?["']([^"']+)["']\s*,\s*[rbf]?["'][^"']*[wax+]"#,
    r#"\b(?:writeFile|writeFileSync|appendFile|appendFileSync|createWriteStream)\s*\(\s*["'`]([^"'`]+)["'`]"#,
    r#"\b(?:fs::write|File::create|OpenOptions::new\(\)[^;]*\.open)\s*\(\s*"([^"]+)""#,
    r#"\b(?:shutil\.(?:copy|copyfile|move)|os\.(?:rename|replace|remove|unlink))\s*\([^,]*,\s*["']([^"']+)["']"#,
    r#"\bos\.(?:remove|unlink|rmdir)\s*\(\s*["']([^"']+)["']"#,
    r#"(?:^|[^>&0-9])>>?\s*([/~][^\s;|&'"]+)"#,
];

/// Detector for filesystem access outside the skill boundary.
#[derive(Debug)]
pub struct FilesystemDetector {
    escapes: Vec<(Regex, Severity, &'static str)>,
    writes: Vec<Regex>,
}

impl FilesystemDetector {
    /// Compile the detector patterns.
    pub fn new() -> Self {
        Self {
            escapes: ESCAPE_PATTERNS
                .iter()
                .filter_map(|(p, s, l)| Regex::new(p).ok().map(|re| (re, *s, *l)))
                .collect(),
            writes: WRITE_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }

    /// Scan one source file.
    pub fn scan(&self, file: &SourceFile, profile: &SecurityProfile, out: &mut Vec<Finding>) {
        let output_dir = Path::new(&profile.output_dir);

        for (index, line) in file.contents.lines().enumerate() {
            if is_comment(line) {
                continue;
            }
            let line_no = Some(index.saturating_add(1));

            for (re, severity, label) in &self.escapes {
                if re.is_match(line) {
                    out.push(Finding::at(
                        FindingCategory::FilesystemEscape,
                        *severity,
                        &file.path,
                        line_no,
                        (*label).to_owned(),
                    ));
                }
            }

            for re in &self.writes {
                for caps in re.captures_iter(line) {
                    let Some(target) = caps.get(1) else {
                        continue;
                    };
                    if let Some(severity) = write_target_severity(target.as_str(), output_dir) {
                        out.push(Finding::at(
                            FindingCategory::FilesystemEscape,
                            severity,
                            &file.path,
                            line_no,
                            format!("write outside output directory: {}", target.as_str()),
                        ));
                    }
                }
            }
        }
    }
}

impl Default for FilesystemDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Severity of writing to `target`, `None` when the write stays in the
/// output directory.
pub fn write_target_severity(target: &str, output_dir: &Path) -> Option<Severity> {
    let path = Path::new(target);
    if let Ok(rest) = path.strip_prefix(SANDBOX_OUTPUT_MOUNT) {
        return if stays_inside(rest) {
            None
        } else {
            Some(Severity::High)
        };
    }
    if path.starts_with("/dev/null") || target.starts_with("/dev/std") {
        return None;
    }
    // tmpfs inside the sandbox, but still outside the declared output.
    if path.starts_with("/tmp") {
        return Some(Severity::Medium);
    }
    if path.is_absolute() || target.starts_with('~') {
        return Some(Severity::High);
    }
    let relative = path.strip_prefix(".").unwrap_or(path);
    if relative.starts_with(output_dir) {
        let rest = relative.strip_prefix(output_dir).ok()?;
        if stays_inside(rest) {
            return None;
        }
    }
    Some(Severity::High)
}

fn stays_inside(path: &Path) -> bool {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth = depth.saturating_add(1),
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth = depth.saturating_sub(1);
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
