//! CLI contract tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::str::contains;

const MANIFEST: &str = "---\nname: arxiv-search\ndescription: Search arXiv papers\nsecurity:\n  egress: [export.arxiv.org]\n---\n## Commands\n- search: `python search.py {query}`\n";

fn cmd(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("skillgate").expect("binary should build");
    cmd.arg("--home").arg(home).env_remove("RUST_LOG");
    cmd
}

fn skill_fixture(dir: &Path, source: &str) -> PathBuf {
    let root = dir.join("arxiv-search");
    std::fs::create_dir_all(&root).expect("skill dir");
    std::fs::write(root.join("SKILL.md"), MANIFEST).expect("manifest");
    std::fs::write(root.join("search.py"), source).expect("source");
    root
}

#[test]
fn help_lists_subcommands() {
    let home = tempfile::tempdir().expect("home");
    let output = cmd(home.path()).arg("--help").assert().success().get_output().stdout.clone();
    let help = String::from_utf8(output).expect("utf-8 help");
    for sub in ["init", "audit", "install", "run", "status", "history", "review", "promote", "reaudit", "serve"] {
        assert!(help.contains(sub), "missing {sub}");
    }
}

#[test]
fn init_creates_layout_and_config() {
    let home = tempfile::tempdir().expect("home");
    cmd(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("initialised"));
    assert!(home.path().join("config.toml").is_file());
    assert!(home.path().join("data").join("outputs").is_dir());
    assert!(home.path().join("skills").is_dir());

    let config = std::fs::read_to_string(home.path().join("config.toml")).expect("config");
    assert!(config.contains("promotion_threshold = 100"));
}

#[test]
fn status_on_fresh_home_lists_nothing() {
    let home = tempfile::tempdir().expect("home");
    cmd(home.path()).arg("init").assert().success();
    cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("no skills installed"));
}

#[test]
fn audit_clean_skill_succeeds() {
    let home = tempfile::tempdir().expect("home");
    let skills = tempfile::tempdir().expect("skills");
    let root = skill_fixture(skills.path(), "print('papers')\n");
    cmd(home.path())
        .arg("audit")
        .arg(&root)
        .assert()
        .success()
        .stdout(contains("arxiv-search [SECURE] 0 finding(s)"));
}

#[test]
fn audit_with_high_finding_exits_two() {
    let home = tempfile::tempdir().expect("home");
    let skills = tempfile::tempdir().expect("skills");
    let root = skill_fixture(skills.path(), "print(open(\"/etc/passwd\").read())\n");
    let output = cmd(home.path())
        .arg("audit")
        .arg(&root)
        .arg("--json")
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output).expect("json report");
    assert_eq!(report["skill_id"], "arxiv-search");
    assert_eq!(report["findings"][0]["severity"], "high");
}

#[test]
fn audit_without_manifest_fails() {
    let home = tempfile::tempdir().expect("home");
    let empty = tempfile::tempdir().expect("empty");
    cmd(home.path())
        .arg("audit")
        .arg(empty.path())
        .assert()
        .failure()
        .stderr(contains("manifest parse error"));
}

#[test]
fn run_rejects_malformed_arguments() {
    let home = tempfile::tempdir().expect("home");
    cmd(home.path())
        .args(["run", "arxiv-search", "search", "--arg", "=oops"])
        .assert()
        .failure()
        .stderr(contains("expected key=value"));
}

const GREETER: &str = "---\nname: greeter\ndescription: Says hello\nsecurity:\n  sensitive_commands: [echo]\n---\n## Commands\n- hi: `echo hi`\n";

fn run_args() -> [&'static str; 7] {
    ["run", "greeter", "hi", "--user", "alice", "--project", "lab"]
}

#[test]
fn approved_lease_carries_over_to_the_next_invocation() {
    use std::io::{BufRead, BufReader, Write};
    use std::process::Stdio;

    use assert_cmd::cargo::CommandCargoExt;

    let home = tempfile::tempdir().expect("home");
    std::fs::write(
        home.path().join("config.toml"),
        "[sandbox]\nfault_retries = 0\n",
    )
    .expect("config");
    let skill_dir = tempfile::tempdir().expect("skill dir");
    let root = skill_dir.path().join("greeter");
    std::fs::create_dir_all(&root).expect("skill root");
    std::fs::write(root.join("SKILL.md"), GREETER).expect("manifest");
    cmd(home.path()).arg("install").arg(&root).assert().success();

    let mut first = std::process::Command::cargo_bin("skillgate")
        .expect("binary should build")
        .arg("--home")
        .arg(home.path())
        .args(run_args())
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn first run");
    let mut stdin = first.stdin.take().expect("stdin");
    let mut lines = BufReader::new(first.stderr.take().expect("stderr")).lines();
    let request_id = loop {
        let line = lines
            .next()
            .expect("prompt before exit")
            .expect("utf-8 stderr");
        if let Some(rest) = line.strip_prefix("answer a:") {
            break rest.split_whitespace().next().expect("request id").to_owned();
        }
    };
    writeln!(stdin, "a:{request_id}").expect("answer");
    drop(stdin);
    let first_log: Vec<String> = lines.map_while(Result::ok).collect();
    first.wait().expect("first run exits");
    assert!(
        first_log.iter().any(|l| l.contains("session lease granted")),
        "{first_log:?}"
    );

    let output = cmd(home.path())
        .args(run_args())
        .write_stdin("")
        .output()
        .expect("second run");
    let second_log = String::from_utf8_lossy(&output.stderr);
    assert!(!second_log.contains("Approval required"), "{second_log}");
    assert!(second_log.contains("covered by session lease"), "{second_log}");
}
