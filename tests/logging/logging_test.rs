//! Tests for `src/logging.rs`.

use skillgate::logging::LoggingGuard;

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    // Only one global subscriber per process; the directory is created
    // before installation is attempted.
    let _result = skillgate::logging::init_production(&logs_dir);
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[test]
fn trail_files_are_daily_jsonl() {
    use std::io::Write;

    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    let mut trail = skillgate::logging::trail_appender(&logs_dir).expect("trail");
    trail
        .write_all(b"{\"message\":\"skill installed\"}\n")
        .expect("write");
    trail.flush().expect("flush");

    let names: Vec<String> = std::fs::read_dir(&logs_dir)
        .expect("read logs dir")
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1, "{names:?}");
    assert!(names[0].starts_with("skillgate."), "{names:?}");
    assert!(names[0].ends_with(".jsonl"), "{names:?}");
}

#[test]
fn init_cli_twice_is_harmless() {
    skillgate::logging::init_cli();
    skillgate::logging::init_cli();
    tracing::info!("still logging");
}
