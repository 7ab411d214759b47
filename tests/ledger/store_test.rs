//! Tests for `src/ledger/store.rs` against an in-memory database.

use std::path::PathBuf;

use chrono::{Duration, Utc};
use skillgate::approval::{ApprovalKind, ApprovalRequest, Decision, Scope, SessionLease};
use skillgate::audit::{Finding, FindingCategory, Location, RiskReport, Severity};
use skillgate::executor::ExecutorKind;
use skillgate::ledger::{Invocation, LedgerError, Outcome, TrustLedger, TrustState};
use skillgate::policy::RiskLevel;
use skillgate::skill::manifest::parse_manifest;
use skillgate::skill::{Skill, SkillId, SourceTree};

const MANIFEST: &str = "---\nname: arxiv-search\ndescription: Search arXiv\n---\n## Commands\n- search: `python search.py {query}`\n";

fn skill(source: &str) -> Skill {
    let manifest = parse_manifest(MANIFEST).expect("manifest");
    let tree = SourceTree::from_files(
        "/skills/arxiv-search",
        vec![(PathBuf::from("search.py"), source.to_owned())],
    );
    Skill::new(manifest, &tree)
}

fn id() -> SkillId {
    SkillId::parse("arxiv-search").expect("id")
}

fn report(skill: &Skill, high: bool) -> RiskReport {
    let findings = if high {
        vec![Finding {
            category: FindingCategory::FilesystemEscape,
            severity: Severity::High,
            location: Location {
                file: PathBuf::from("search.py"),
                line: Some(1),
            },
            description: "reference to system path".to_owned(),
        }]
    } else {
        Vec::new()
    };
    RiskReport {
        skill_id: skill.id.clone(),
        source_digest: skill.source_digest.clone(),
        findings,
    }
}

fn invocation(n: u32, outcome: Outcome) -> Invocation {
    Invocation {
        id: format!("inv-{n}"),
        skill_id: id(),
        timestamp: Utc::now(),
        outcome,
        flagged: outcome == Outcome::PolicyViolation,
        duration_ms: 12,
        command: "search".to_owned(),
        executor: ExecutorKind::Sandbox,
        detail: None,
    }
}

async fn sandboxed(threshold: u32) -> (TrustLedger, Skill) {
    let ledger = TrustLedger::in_memory(threshold).await.expect("ledger");
    let skill = skill("print('v1')\n");
    let guard = ledger.acquire(&skill.id).await;
    ledger
        .register(&guard, &skill, "operator")
        .await
        .expect("register");
    let record = ledger
        .record_audit(&guard, &report(&skill, false), "operator")
        .await
        .expect("audit");
    assert_eq!(record.state, TrustState::Sandboxed);
    (ledger, skill)
}

#[tokio::test]
async fn register_starts_unaudited_at_epoch_one() {
    let ledger = TrustLedger::in_memory(100).await.expect("ledger");
    let skill = skill("print('v1')\n");
    let guard = ledger.acquire(&skill.id).await;

    let record = ledger
        .register(&guard, &skill, "operator")
        .await
        .expect("register");
    assert_eq!(record.state, TrustState::Unaudited);
    assert_eq!(record.epoch, 1);
    assert_eq!(record.clean_runs, 0);
    assert_eq!(record.source_digest, skill.source_digest);

    let again = ledger
        .register(&guard, &skill, "operator")
        .await
        .expect("register");
    assert_eq!(again, record);
}

#[tokio::test]
async fn unknown_skill_is_reported() {
    let ledger = TrustLedger::in_memory(100).await.expect("ledger");
    let err = ledger.require(&id()).await.expect_err("should fail");
    assert!(matches!(err, LedgerError::UnknownSkill(_)));
    assert!(ledger.record(&id()).await.expect("read").is_none());
}

#[tokio::test]
async fn high_finding_report_quarantines() {
    let ledger = TrustLedger::in_memory(100).await.expect("ledger");
    let skill = skill("print(open('/etc/passwd').read())\n");
    let guard = ledger.acquire(&skill.id).await;
    ledger
        .register(&guard, &skill, "operator")
        .await
        .expect("register");

    let record = ledger
        .record_audit(&guard, &report(&skill, true), "operator")
        .await
        .expect("audit");
    assert_eq!(record.state, TrustState::Quarantined);

    let latest = ledger
        .latest_report(&skill.id)
        .await
        .expect("read")
        .expect("report stored");
    assert!(latest.has_high());
}

#[tokio::test]
async fn audit_twice_in_one_epoch_is_rejected() {
    let (ledger, skill) = sandboxed(100).await;
    let guard = ledger.acquire(&skill.id).await;
    let err = ledger
        .record_audit(&guard, &report(&skill, false), "operator")
        .await
        .expect_err("should fail");
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    assert_eq!(ledger.report_count(&skill.id).await.expect("count"), 1);
}

#[tokio::test]
async fn clean_runs_reach_pending_promotion() {
    let (ledger, skill) = sandboxed(3).await;
    let guard = ledger.acquire(&skill.id).await;

    let mut record = None;
    for n in 0..3 {
        record = Some(
            ledger
                .record_invocation(&guard, &invocation(n, Outcome::Success))
                .await
                .expect("record"),
        );
    }
    let record = record.expect("three runs");
    assert_eq!(record.state, TrustState::PendingPromotion);
    assert_eq!(record.clean_runs, 3);

    let transitions = ledger.transitions(&skill.id).await.expect("transitions");
    let last = transitions.last().expect("transition");
    assert_eq!(last.from, TrustState::Sandboxed);
    assert_eq!(last.to, TrustState::PendingPromotion);
    assert_eq!(last.actor, "executor");
}

#[tokio::test]
async fn flagged_invocation_quarantines_and_is_logged() {
    let (ledger, skill) = sandboxed(3).await;
    let guard = ledger.acquire(&skill.id).await;
    ledger
        .record_invocation(&guard, &invocation(1, Outcome::Success))
        .await
        .expect("record");
    let mut flagged = invocation(2, Outcome::PolicyViolation);
    flagged.detail = Some("disallowed egress to evil.example.com".to_owned());
    let record = ledger
        .record_invocation(&guard, &flagged)
        .await
        .expect("record");
    assert_eq!(record.state, TrustState::Quarantined);
    assert_eq!(record.clean_runs, 0);

    let history = ledger.history(&skill.id, 10).await.expect("history");
    assert_eq!(history.len(), 2);
    assert!(history[0].invocation.flagged);
    assert_eq!(history[0].epoch, 1);
    assert_eq!(
        history[0].invocation.detail.as_deref(),
        Some("disallowed egress to evil.example.com")
    );

    let err = ledger
        .record_invocation(&guard, &invocation(3, Outcome::Success))
        .await
        .expect_err("should fail");
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));
}

#[tokio::test]
async fn guard_for_another_skill_is_refused() {
    let (ledger, skill) = sandboxed(3).await;
    let other = SkillId::parse("other").expect("id");
    let guard = ledger.acquire(&other).await;

    let err = ledger
        .record_invocation(&guard, &invocation(1, Outcome::Success))
        .await
        .expect_err("should fail");
    assert!(matches!(err, LedgerError::GuardMismatch { .. }));
    assert_eq!(ledger.require(&skill.id).await.expect("record").clean_runs, 0);
}

#[tokio::test]
async fn held_guard_makes_try_acquire_busy() {
    let ledger = TrustLedger::in_memory(3).await.expect("ledger");
    let guard = ledger.acquire(&id()).await;
    let err = ledger.try_acquire(&id()).expect_err("should fail");
    assert!(matches!(err, LedgerError::Busy(_)));

    drop(guard);
    ledger.try_acquire(&id()).expect("free after drop");
}

#[tokio::test]
async fn stale_record_write_is_a_conflict() {
    let (ledger, skill) = sandboxed(3).await;
    let guard = ledger.acquire(&skill.id).await;
    let stale = ledger.require(&skill.id).await.expect("record");
    let step = stale
        .status()
        .apply_invocation(Outcome::Success, false, 3)
        .expect("step");

    let current = ledger
        .record_invocation(&guard, &invocation(1, Outcome::Success))
        .await
        .expect("invocation");
    assert_eq!(current.version, stale.version.saturating_add(1));
    let transitions = ledger.transitions(&skill.id).await.expect("transitions").len();

    let err = ledger
        .commit_step(&guard, &stale, &step, "racer")
        .await
        .expect_err("should fail");
    assert!(matches!(err, LedgerError::TrustStateConflict(ref s) if s == &skill.id));

    let after = ledger.require(&skill.id).await.expect("record");
    assert_eq!(after, current);
    assert_eq!(
        ledger.transitions(&skill.id).await.expect("transitions").len(),
        transitions
    );

    let fresh_step = after
        .status()
        .apply_invocation(Outcome::Success, false, 3)
        .expect("step");
    let moved = ledger
        .commit_step(&guard, &after, &fresh_step, "executor")
        .await
        .expect("current version applies");
    assert_eq!(moved.clean_runs, 2);
}

#[tokio::test]
async fn promotion_and_review_are_recorded() {
    let (ledger, skill) = sandboxed(1).await;
    let guard = ledger.acquire(&skill.id).await;

    let err = ledger
        .manual_review(&guard, "security-lead", "")
        .await
        .expect_err("should fail");
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));

    ledger
        .record_invocation(&guard, &invocation(1, Outcome::Success))
        .await
        .expect("record");
    let record = ledger
        .approve_promotion(&guard, "security-lead", "Ab12Cd34")
        .await
        .expect("promote");
    assert_eq!(record.state, TrustState::Trusted);

    let promotions = ledger.promotions(&skill.id).await.expect("promotions");
    assert_eq!(promotions.len(), 1);
    assert_eq!(promotions[0].approval_id, "Ab12Cd34");

    let mut flagged = invocation(2, Outcome::PolicyViolation);
    flagged.executor = ExecutorKind::Host;
    ledger
        .record_invocation(&guard, &flagged)
        .await
        .expect("record");

    let record = ledger
        .manual_review(&guard, "security-lead", "proxy misconfiguration")
        .await
        .expect("review");
    assert_eq!(record.state, TrustState::Sandboxed);
    assert_eq!(record.clean_runs, 0);

    let transitions = ledger.transitions(&skill.id).await.expect("transitions");
    let last = transitions.last().expect("transition");
    assert_eq!(last.actor, "security-lead");
    assert!(last.reason.ends_with("proxy misconfiguration"), "{}", last.reason);

    assert_eq!(ledger.promotions(&skill.id).await.expect("promotions").len(), 1);
}

#[tokio::test]
async fn reset_opens_new_epoch_and_keeps_history() {
    let (ledger, skill) = sandboxed(5).await;
    let guard = ledger.acquire(&skill.id).await;
    for n in 0..2 {
        ledger
            .record_invocation(&guard, &invocation(n, Outcome::Success))
            .await
            .expect("record");
    }

    let updated = self::skill("print('v2')\n");
    let record = ledger
        .register(&guard, &updated, "operator")
        .await
        .expect("register changed source");
    assert_eq!(record.state, TrustState::Unaudited);
    assert_eq!(record.epoch, 2);
    assert_eq!(record.clean_runs, 0);
    assert_eq!(record.source_digest, updated.source_digest);

    let record = ledger
        .record_audit(&guard, &report(&updated, false), "operator")
        .await
        .expect("audit");
    assert_eq!(record.state, TrustState::Sandboxed);

    let history = ledger.history(&skill.id, 10).await.expect("history");
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|e| e.epoch == 1));
    assert_eq!(ledger.report_count(&skill.id).await.expect("count"), 2);

    let transitions = ledger.transitions(&skill.id).await.expect("transitions");
    assert!(transitions
        .iter()
        .any(|t| t.to == TrustState::Unaudited && t.epoch == 2 && t.reason.starts_with("re-audit")));
}

#[tokio::test]
async fn reset_from_quarantine_holds_quarantine() {
    let (ledger, skill) = sandboxed(5).await;
    let guard = ledger.acquire(&skill.id).await;
    ledger
        .record_invocation(&guard, &invocation(1, Outcome::PolicyViolation))
        .await
        .expect("record");

    let updated = self::skill("print('v2')\n");
    ledger
        .reset(&guard, &updated, "operator", "requested")
        .await
        .expect("reset");
    let record = ledger
        .record_audit(&guard, &report(&updated, false), "operator")
        .await
        .expect("audit");
    assert_eq!(record.state, TrustState::Quarantined);
    assert_eq!(record.epoch, 2);
}

#[tokio::test]
async fn terminal_approval_is_not_overwritten() {
    let (ledger, skill) = sandboxed(5).await;
    let now = Utc::now();
    let mut request = ApprovalRequest {
        id: "Ab12Cd34".to_owned(),
        skill_id: skill.id.clone(),
        kind: ApprovalKind::Action,
        action_description: "run `curl -s 'https://export.arxiv.org'`".to_owned(),
        risk_level: RiskLevel::Medium,
        requester: Scope::new("alice", "research"),
        created_at: now,
        expires_at: now.checked_add_signed(Duration::minutes(5)).expect("deadline"),
        decision: Decision::Pending,
        approver: None,
        decided_at: None,
    };
    ledger.record_approval(&request).await.expect("pending");

    request.decision = Decision::Approved;
    request.approver = Some("alice".to_owned());
    request.decided_at = Some(now);
    ledger.record_approval(&request).await.expect("approved");

    request.decision = Decision::Denied;
    request.approver = Some("mallory".to_owned());
    ledger.record_approval(&request).await.expect("ignored");

    let row: (String, Option<String>) =
        sqlx::query_as("SELECT decision, approver FROM approvals WHERE id = 'Ab12Cd34'")
            .fetch_one(ledger.pool())
            .await
            .expect("row");
    assert_eq!(row.0, "approved");
    assert_eq!(row.1.as_deref(), Some("alice"));
}

#[tokio::test]
async fn leases_round_trip_until_expiry() {
    let ledger = TrustLedger::in_memory(100).await.expect("ledger");
    let now = Utc::now();
    let lease = SessionLease {
        user_id: "alice".to_owned(),
        project_scope: "research".to_owned(),
        granted_at: now,
        expires_at: now.checked_add_signed(Duration::minutes(30)).expect("expiry"),
        max_risk: RiskLevel::Medium,
        approval_id: "Ab12Cd34".to_owned(),
    };
    ledger.record_lease(&lease).await.expect("record");

    let mut refreshed = lease.clone();
    refreshed.max_risk = RiskLevel::High;
    refreshed.approval_id = "Ef56Gh78".to_owned();
    ledger.record_lease(&refreshed).await.expect("refresh");

    let active = ledger.active_leases(now).await.expect("active");
    assert_eq!(active, vec![refreshed.clone()]);
    assert!(ledger
        .active_leases(refreshed.expires_at)
        .await
        .expect("active at expiry")
        .is_empty());
}
