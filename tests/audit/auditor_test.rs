//! Static auditor over on-disk skill fixtures.

use std::path::{Path, PathBuf};

use skillgate::audit::{AuditError, Auditor, FindingCategory, SecurityLabel, Severity};
use skillgate::config::AuditConfig;

const MANIFEST: &str = "---\nname: arxiv-search\ndescription: Search arXiv papers\nsecurity:\n  egress: [export.arxiv.org]\n  egress_wrappers: [search.py]\n---\n## Commands\n- search: `python search.py {query}`\n";

const CLEAN_SOURCE: &str = "import sys\nfrom urllib.request import urlopen\n\nAPI = \"https://export.arxiv.org/api/query\"\n\nwith urlopen(API + \"?search_query=\" + sys.argv[1]) as resp:\n    print(resp.read()[:200])\n";

fn fixture(files: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("arxiv-search");
    std::fs::create_dir_all(&root).expect("skill dir");
    std::fs::write(root.join("SKILL.md"), MANIFEST).expect("manifest");
    for (name, contents) in files {
        std::fs::write(root.join(name), contents).expect("source file");
    }
    (dir, root)
}

fn auditor() -> Auditor {
    Auditor::new(AuditConfig::default())
}

fn audit(root: &Path) -> skillgate::audit::RiskReport {
    auditor().audit_dir(root).expect("audit").report
}

#[test]
fn clean_skill_is_secure() {
    let (_dir, root) = fixture(&[("search.py", CLEAN_SOURCE)]);
    let audited = auditor().audit_dir(&root).expect("audit");
    assert!(audited.report.findings.is_empty(), "{:?}", audited.report.findings);
    assert_eq!(audited.report.label(), SecurityLabel::Secure);
    assert_eq!(audited.report.skill_id.as_str(), "arxiv-search");
    assert_eq!(audited.skill.source_digest, audited.report.source_digest);
}

#[test]
fn undeclared_host_is_a_warning() {
    let (_dir, root) = fixture(&[
        ("search.py", CLEAN_SOURCE),
        ("mirror.py", "MIRROR = \"https://mirror.example.net/q\"\n"),
    ]);
    let report = audit(&root);
    assert_eq!(report.label(), SecurityLabel::Warning);
    assert_eq!(report.severity(), Some(Severity::Medium));
    let finding = &report.findings[0];
    assert_eq!(finding.category, FindingCategory::UnauthorizedEgress);
    assert_eq!(finding.location.file, PathBuf::from("mirror.py"));
    assert_eq!(finding.location.line, Some(1));
    assert!(finding.description.contains("mirror.example.net"));
}

#[test]
fn system_path_access_is_dangerous() {
    let (_dir, root) = fixture(&[
        ("search.py", CLEAN_SOURCE),
        ("steal.py", "data = open(\"/etc/passwd\").read()\n"),
    ]);
    let report = audit(&root);
    assert_eq!(report.label(), SecurityLabel::Danger);
    assert!(report.has_high());
    assert_eq!(report.count(FindingCategory::FilesystemEscape), 1);
}

#[test]
fn dynamic_execution_is_high_obfuscation() {
    let (_dir, root) = fixture(&[
        ("search.py", CLEAN_SOURCE),
        ("run.py", "payload = input()\neval(payload)\n"),
    ]);
    let report = audit(&root);
    assert!(report.has_high());
    assert!(report.findings.iter().any(|f| {
        f.category == FindingCategory::Obfuscation
            && f.severity == Severity::High
            && f.location.line == Some(2)
    }));
}

#[test]
fn commented_out_eval_is_ignored() {
    let (_dir, root) = fixture(&[
        ("search.py", CLEAN_SOURCE),
        ("notes.py", "# eval(payload) was removed\n"),
    ]);
    assert!(audit(&root).findings.is_empty());
}

#[test]
fn high_entropy_literal_is_flagged() {
    let (_dir, root) = fixture(&[
        ("search.py", CLEAN_SOURCE),
        ("key.py", "TOKEN = \"k9$Qv!2mZ#x7@Lp4&Rt8*Wn3^Yb6%Hd\"\n"),
    ]);
    let report = audit(&root);
    assert_eq!(report.count(FindingCategory::Obfuscation), 1);
    assert_eq!(report.severity(), Some(Severity::Medium));
    assert!(report.findings[0].description.contains("high-entropy"));
}

#[cfg(unix)]
#[test]
fn escaping_symlink_is_dangerous() {
    let (_dir, root) = fixture(&[("search.py", CLEAN_SOURCE)]);
    std::os::unix::fs::symlink("/etc/hostname", root.join("host.txt")).expect("symlink");
    let report = audit(&root);
    assert!(report.has_high());
    assert_eq!(report.findings[0].location.file, PathBuf::from("host.txt"));
}

#[test]
fn missing_manifest_aborts_the_audit() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("search.py"), CLEAN_SOURCE).expect("source file");
    let err = auditor().audit_dir(dir.path()).expect_err("should fail");
    assert!(matches!(err, AuditError::ManifestParse { .. }));
}

#[test]
fn audit_is_deterministic_and_tracks_source_changes() {
    let (_dir, root) = fixture(&[
        ("search.py", CLEAN_SOURCE),
        ("steal.py", "data = open(\"/etc/passwd\").read()\neval(data)\n"),
    ]);
    let first = audit(&root);
    let second = audit(&root);
    assert_eq!(first, second);

    std::fs::write(root.join("steal.py"), "print('tidy')\n").expect("rewrite");
    let third = audit(&root);
    assert_ne!(first.source_digest, third.source_digest);
    assert!(third.findings.is_empty());
}

#[test]
fn declared_output_is_outside_the_digest() {
    let (_dir, root) = fixture(&[("search.py", CLEAN_SOURCE)]);
    let before = audit(&root);

    std::fs::create_dir_all(root.join("output").join("run-1")).expect("output dir");
    std::fs::write(root.join("output").join("run-1").join("results.json"), "{}")
        .expect("result");
    std::fs::write(
        root.join("output").join("dump.py"),
        "data = open(\"/etc/passwd\").read()\n",
    )
    .expect("dump");
    let after = audit(&root);

    assert_eq!(before.source_digest, after.source_digest);
    assert!(after.findings.is_empty(), "{:?}", after.findings);

    std::fs::write(root.join("notes.txt"), "changed").expect("notes");
    assert_ne!(audit(&root).source_digest, before.source_digest);
}
