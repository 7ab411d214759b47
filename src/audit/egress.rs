//! Unauthorized egress detection.

use std::net::IpAddr;
use std::path::Path;

use regex::Regex;

use super::{is_comment, Finding, FindingCategory, Severity};
use crate::policy::{domain_allowed, extract_hosts, is_private_ip};
use crate::skill::manifest::MANIFEST_FILE;
use crate::skill::{Manifest, SecurityProfile, SourceFile};

/// Direct network API patterns with the severity of an unwrapped use.
const NETWORK_APIS: &[(&str, Severity, &str)] = &[
    (r"\bsocket\.socket\s*\(", Severity::High, "raw socket"),
    (r"\bTcpStream::connect\b", Severity::High, "raw TCP stream"),
    (r"\bUdpSocket::bind\b", Severity::High, "raw UDP socket"),
    (r"\bnet\.(?:Dial|createConnection|connect)\b", Severity::High, "raw socket"),
    (r"\brequests\.(?:get|post|put|delete|patch|head|request|Session)\b", Severity::Medium, "requests HTTP call"),
    (r"\burlopen\s*\(", Severity::Medium, "urllib HTTP call"),
    (r"\bhttp\.client\b", Severity::Medium, "http.client usage"),
    (r"\b(?:aiohttp|httpx)\.", Severity::Medium, "async HTTP client"),
    (r"(?:^|[^.\w])fetch\s*\(", Severity::Medium, "fetch() call"),
    (r"\baxios\b", Severity::Medium, "axios HTTP client"),
    (r"\bXMLHttpRequest\b", Severity::Medium, "XMLHttpRequest"),
    (r"\bnew\s+WebSocket\b", Severity::Medium, "WebSocket"),
    (r"\breqwest::", Severity::Medium, "reqwest HTTP client"),
    (r"\bhttp\.(?:Get|Post|NewRequest)\s*\(", Severity::Medium, "Go net/http call"),
    (r"(?:^|[\s;|&(])(?:curl|wget|nc|ncat)\s", Severity::Medium, "network CLI tool"),
];

/// Detector for network contact outside the declared profile.
#[derive(Debug)]
pub struct EgressDetector {
    apis: Vec<(Regex, Severity, &'static str)>,
    ipv4: Option<Regex>,
    hostname: Option<Regex>,
}

impl EgressDetector {
    /// Compile the detector patterns.
    pub fn new() -> Self {
        let apis = NETWORK_APIS
            .iter()
            .filter_map(|(pattern, severity, label)| {
                Regex::new(pattern).ok().map(|re| (re, *severity, *label))
            })
            .collect();
        Self {
            apis,
            ipv4: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").ok(),
            hostname: Regex::new(
                r#"(?i)["']((?:[a-z0-9-]+\.)+(?:com|net|org|io|dev|ai|co|xyz|ru|cn|info|biz|me|app|cloud|top|site|online))["']"#,
            )
            .ok(),
        }
    }

    /// Scan one source file.
    pub fn scan(&self, file: &SourceFile, profile: &SecurityProfile, out: &mut Vec<Finding>) {
        let wrapped = profile
            .egress_wrappers
            .iter()
            .any(|w| Path::new(w) == file.path);

        for (index, line) in file.contents.lines().enumerate() {
            let line_no = Some(index.saturating_add(1));
            let comment = is_comment(line);

            let hosts = extract_hosts(line);
            for host in &hosts {
                if domain_allowed(&profile.egress, host) {
                    continue;
                }
                let severity = if comment {
                    Severity::Low
                } else if host.parse::<IpAddr>().is_ok() {
                    Severity::High
                } else {
                    Severity::Medium
                };
                out.push(Finding::at(
                    FindingCategory::UnauthorizedEgress,
                    severity,
                    &file.path,
                    line_no,
                    format!("URL to undeclared host {host}"),
                ));
            }

            self.scan_ip_literals(line, &hosts, profile, comment, &file.path, line_no, out);
            self.scan_hostnames(line, &hosts, profile, comment, &file.path, line_no, out);

            if wrapped || comment {
                continue;
            }
            if let Some((_, severity, label)) = self.apis.iter().find(|(re, _, _)| re.is_match(line)) {
                out.push(Finding::at(
                    FindingCategory::UnauthorizedEgress,
                    *severity,
                    &file.path,
                    line_no,
                    format!("direct network access ({label}) outside declared egress wrapper"),
                ));
            }
        }
    }

    /// Audit command templates and the allowlist itself.
    pub fn scan_manifest(&self, manifest: &Manifest, out: &mut Vec<Finding>) {
        let manifest_path = Path::new(MANIFEST_FILE);
        let profile = &manifest.security;

        if profile.egress.iter().any(|e| e == "*" || e.starts_with("*:")) {
            out.push(Finding::at(
                FindingCategory::UnauthorizedEgress,
                Severity::High,
                manifest_path,
                None,
                "egress allowlist contains a wildcard entry",
            ));
        }

        for command in &manifest.commands {
            for host in extract_hosts(&command.template) {
                if !domain_allowed(&profile.egress, &host) {
                    out.push(Finding::at(
                        FindingCategory::UnauthorizedEgress,
                        Severity::Medium,
                        manifest_path,
                        Some(command.line),
                        format!("command '{}' contacts undeclared host {host}", command.name),
                    ));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_ip_literals(
        &self,
        line: &str,
        url_hosts: &[String],
        profile: &SecurityProfile,
        comment: bool,
        file: &Path,
        line_no: Option<usize>,
        out: &mut Vec<Finding>,
    ) {
        let Some(ipv4) = &self.ipv4 else {
            return;
        };
        for m in ipv4.find_iter(line) {
            let literal = m.as_str();
            let Ok(addr) = literal.parse::<IpAddr>() else {
                continue;
            };
            if url_hosts.iter().any(|h| h == literal) || domain_allowed(&profile.egress, literal) {
                continue;
            }
            if addr.is_unspecified() {
                continue;
            }
            let (severity, kind) = if comment {
                (Severity::Low, "IP address")
            } else if is_private_ip(&addr) {
                (Severity::High, "internal IP address")
            } else {
                (Severity::High, "IP address")
            };
            out.push(Finding::at(
                FindingCategory::UnauthorizedEgress,
                severity,
                file,
                line_no,
                format!("hard-coded {kind} {literal}"),
            ));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_hostnames(
        &self,
        line: &str,
        url_hosts: &[String],
        profile: &SecurityProfile,
        comment: bool,
        file: &Path,
        line_no: Option<usize>,
        out: &mut Vec<Finding>,
    ) {
        let Some(hostname) = &self.hostname else {
            return;
        };
        for caps in hostname.captures_iter(line) {
            let Some(m) = caps.get(1) else {
                continue;
            };
            let host = m.as_str().to_ascii_lowercase();
            if url_hosts.contains(&host) || domain_allowed(&profile.egress, &host) {
                continue;
            }
            let severity = if comment { Severity::Low } else { Severity::Medium };
            out.push(Finding::at(
                FindingCategory::UnauthorizedEgress,
                severity,
                file,
                line_no,
                format!("hard-coded hostname {host}"),
            ));
        }
    }
}

impl Default for EgressDetector {
    fn default() -> Self {
        Self::new()
    }
}
