//! Obfuscation detection: dynamic code execution, high-entropy literals and
//! encoded blobs.

use std::collections::HashMap;

use base64::Engine;
use regex::Regex;

use super::{is_comment, Finding, FindingCategory, Severity};
use crate::config::AuditConfig;
use crate::skill::SourceFile;

/// Dynamic code execution constructs.
const DYNAMIC_EXEC: &[(&str, Severity, &str)] = &[
    (r"(?:^|[^.\w])eval\s*\(", Severity::High, "eval()"),
    (r"(?:^|[^.\w])exec\s*\(", Severity::High, "exec()"),
    (r"\bnew\s+Function\s*\(", Severity::High, "new Function()"),
    (r"\b__import__\s*\(", Severity::High, "__import__()"),
    (r#"\bcompile\s*\([^)]*["']exec["']"#, Severity::High, "compile(..., 'exec')"),
    (r"(?:base64\s+(?:-d|--decode)|b64decode)[^|]*\|\s*(?:ba)?sh\b", Severity::High, "decoded payload piped to a shell"),
    (r"\b(?:pickle|marshal)\.loads?\s*\(", Severity::High, "deserialisation of code objects"),
    (r"\bimportlib\.import_module\s*\(", Severity::Medium, "dynamic import"),
    (r"\bgetattr\s*\(\s*__builtins__", Severity::Medium, "builtins lookup by name"),
    (r"\bvm\.runIn(?:This|New)?Context\s*\(", Severity::Medium, "vm.runInContext()"),
    (r"\bString\.fromCharCode\s*\(", Severity::Low, "character-code string assembly"),
];

/// Detector for code that hides its behaviour.
#[derive(Debug)]
pub struct ObfuscationDetector {
    exec: Vec<(Regex, Severity, &'static str)>,
    literal: Option<Regex>,
    blob: Option<Regex>,
    entropy_threshold: f64,
    min_entropy_len: usize,
    blob_high_len: usize,
}

impl ObfuscationDetector {
    /// Compile the detector patterns with the configured thresholds.
    pub fn new(config: &AuditConfig) -> Self {
        let min_literal = config.min_entropy_len.max(1);
        let min_blob = config.encoded_blob_len.max(8);
        Self {
            exec: DYNAMIC_EXEC
                .iter()
                .filter_map(|(p, s, l)| Regex::new(p).ok().map(|re| (re, *s, *l)))
                .collect(),
            literal: Regex::new(&format!(
                r#""([^"\\\s]{{{min_literal},}})"|'([^'\\\s]{{{min_literal},}})'"#
            ))
            .ok(),
            blob: Regex::new(&format!(r"[A-Za-z0-9+/]{{{min_blob},}}={{0,2}}")).ok(),
            entropy_threshold: config.entropy_threshold,
            min_entropy_len: min_literal,
            blob_high_len: config.encoded_blob_high_len,
        }
    }

    /// Scan one source file.
    pub fn scan(&self, file: &SourceFile, out: &mut Vec<Finding>) {
        for (index, line) in file.contents.lines().enumerate() {
            let line_no = Some(index.saturating_add(1));
            let comment = is_comment(line);

            if !comment {
                for (re, severity, label) in &self.exec {
                    if re.is_match(line) {
                        out.push(Finding::at(
                            FindingCategory::Obfuscation,
                            *severity,
                            &file.path,
                            line_no,
                            format!("dynamic code execution: {label}"),
                        ));
                    }
                }
            }

            if self.scan_blobs(line, file, line_no, out) {
                continue;
            }
            self.scan_literals(line, file, line_no, out);
        }
    }

    /// Returns `true` when at least one blob was reported on the line.
    fn scan_blobs(
        &self,
        line: &str,
        file: &SourceFile,
        line_no: Option<usize>,
        out: &mut Vec<Finding>,
    ) -> bool {
        let Some(blob) = &self.blob else {
            return false;
        };
        let mut found = false;
        for m in blob.find_iter(line) {
            let candidate = m.as_str();
            if !decodes_as_base64(candidate) {
                continue;
            }
            let severity = if candidate.len() >= self.blob_high_len {
                Severity::High
            } else {
                Severity::Medium
            };
            out.push(Finding::at(
                FindingCategory::Obfuscation,
                severity,
                &file.path,
                line_no,
                format!("encoded blob of {} characters", candidate.len()),
            ));
            found = true;
        }
        found
    }

    fn scan_literals(
        &self,
        line: &str,
        file: &SourceFile,
        line_no: Option<usize>,
        out: &mut Vec<Finding>,
    ) {
        let Some(literal) = &self.literal else {
            return;
        };
        for caps in literal.captures_iter(line) {
            let Some(value) = caps.get(1).or_else(|| caps.get(2)) else {
                continue;
            };
            let value = value.as_str();
            if value.len() < self.min_entropy_len || value.contains("://") {
                continue;
            }
            let entropy = shannon_entropy(value);
            if entropy >= self.entropy_threshold {
                out.push(Finding::at(
                    FindingCategory::Obfuscation,
                    Severity::Medium,
                    &file.path,
                    line_no,
                    format!(
                        "high-entropy string literal ({entropy:.2} bits/char, {} chars)",
                        value.len()
                    ),
                ));
            }
        }
    }
}

/// Shannon entropy of a string in bits per character.
pub fn shannon_entropy(value: &str) -> f64 {
    let mut counts: HashMap<char, u32> = HashMap::new();
    let mut total: u32 = 0;
    for c in value.chars() {
        let slot = counts.entry(c).or_insert(0);
        *slot = slot.saturating_add(1);
        total = total.saturating_add(1);
    }
    if total == 0 {
        return 0.0;
    }
    let total = f64::from(total);
    counts
        .values()
        .map(|&count| {
            let p = f64::from(count) / total;
            -p * p.log2()
        })
        .sum()
}

/// Whether a candidate decodes as standard base64 (padding optional).
fn decodes_as_base64(candidate: &str) -> bool {
    let trimmed = candidate.trim_end_matches('=');
    // Identifiers and paths made only of letters are not blobs.
    let has_digit_or_symbol = trimmed
        .chars()
        .any(|c| c.is_ascii_digit() || c == '+' || c == '/');
    let has_mixed_case = trimmed.chars().any(|c| c.is_ascii_uppercase())
        && trimmed.chars().any(|c| c.is_ascii_lowercase());
    if !(has_digit_or_symbol && has_mixed_case) {
        return false;
    }
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .is_ok()
}
