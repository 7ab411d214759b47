//! Tests for `src/approval/mod.rs` over a recording channel.

use std::sync::Arc;

use chrono::Utc;
use skillgate::approval::{
    ApprovalChannel, ApprovalError, ApprovalGateway, ApprovalKind, ApprovalPrompt,
    ApprovalResponse, Authorization, Decision, Scope,
};
use skillgate::config::ApprovalConfig;
use skillgate::policy::RiskLevel;
use skillgate::skill::SkillId;
use tokio::sync::mpsc;

/// Forwards every prompt to the test.
struct RecordingChannel {
    tx: mpsc::UnboundedSender<ApprovalPrompt>,
}

#[async_trait::async_trait]
impl ApprovalChannel for RecordingChannel {
    async fn send(&self, prompt: &ApprovalPrompt) -> Result<(), ApprovalError> {
        self.tx
            .send(prompt.clone())
            .map_err(|e| ApprovalError::Channel(e.to_string()))
    }
}

/// Always fails delivery.
struct BrokenChannel;

#[async_trait::async_trait]
impl ApprovalChannel for BrokenChannel {
    async fn send(&self, _prompt: &ApprovalPrompt) -> Result<(), ApprovalError> {
        Err(ApprovalError::Channel("bot token revoked".to_owned()))
    }
}

fn gateway(config: ApprovalConfig) -> (Arc<ApprovalGateway>, mpsc::UnboundedReceiver<ApprovalPrompt>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let gateway = Arc::new(ApprovalGateway::new(Arc::new(RecordingChannel { tx }), config));
    (gateway, rx)
}

fn skill() -> SkillId {
    SkillId::parse("arxiv-search").expect("id")
}

fn scope() -> Scope {
    Scope::new("alice", "research")
}

fn respond(id: &str, decision: Decision, who: &str) -> ApprovalResponse {
    ApprovalResponse {
        request_id: id.to_owned(),
        decision,
        approver_identity: who.to_owned(),
    }
}

/// Start an authorisation in the background and return it with its prompt.
async fn pending_authorization(
    gateway: &Arc<ApprovalGateway>,
    rx: &mut mpsc::UnboundedReceiver<ApprovalPrompt>,
    risk: RiskLevel,
) -> (tokio::task::JoinHandle<Authorization>, ApprovalPrompt) {
    let gw = Arc::clone(gateway);
    let handle = tokio::spawn(async move {
        gw.authorize(&skill(), "run `curl -s https://export.arxiv.org`", risk, &scope())
            .await
    });
    let prompt = rx.recv().await.expect("prompt delivered");
    (handle, prompt)
}

#[tokio::test]
async fn below_threshold_needs_no_prompt() {
    let (gateway, mut rx) = gateway(ApprovalConfig::default());
    let auth = gateway
        .authorize(&skill(), "run `python search.py`", RiskLevel::Low, &scope())
        .await;
    assert!(matches!(auth, Authorization::NotRequired));
    assert!(auth.is_granted());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn approval_grants_lease_up_to_its_risk() {
    let (gateway, mut rx) = gateway(ApprovalConfig::default());
    let (handle, prompt) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;
    assert_eq!(prompt.kind, ApprovalKind::Action);
    assert_eq!(prompt.request_id.len(), 8);

    gateway
        .resolve(respond(&prompt.request_id, Decision::Approved, "alice"))
        .expect("resolve");
    let auth = handle.await.expect("join");
    let request = match auth {
        Authorization::Approved(request) => request,
        other => panic!("unexpected authorization: {other:?}"),
    };
    assert_eq!(request.approver.as_deref(), Some("alice"));
    assert!(request.decided_at.is_some());

    let leases = gateway.leases().active(Utc::now());
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].max_risk, RiskLevel::Medium);
    assert_eq!(leases[0].approval_id, request.id);

    let auth = gateway
        .authorize(&skill(), "run again", RiskLevel::Medium, &scope())
        .await;
    assert!(matches!(auth, Authorization::Leased(_)));
    assert!(rx.try_recv().is_err());

    let (handle, prompt) = pending_authorization(&gateway, &mut rx, RiskLevel::High).await;
    assert_eq!(prompt.risk_level, RiskLevel::High);
    gateway
        .resolve(respond(&prompt.request_id, Decision::Denied, "alice"))
        .expect("resolve");
    assert!(matches!(handle.await.expect("join"), Authorization::Denied(_)));
}

#[tokio::test]
async fn denial_grants_no_lease() {
    let (gateway, mut rx) = gateway(ApprovalConfig::default());
    let (handle, prompt) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;
    gateway
        .resolve(respond(&prompt.request_id, Decision::Denied, "bob"))
        .expect("resolve");
    let auth = handle.await.expect("join");
    assert!(!auth.is_granted());
    assert!(gateway.leases().active(Utc::now()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_expires() {
    let (gateway, mut rx) = gateway(ApprovalConfig::default());
    let (handle, prompt) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;

    let auth = handle.await.expect("join");
    let request = match auth {
        Authorization::Expired(request) => request,
        other => panic!("unexpected authorization: {other:?}"),
    };
    assert_eq!(request.decision, Decision::Expired);
    assert!(request.approver.is_none());
    assert_eq!(gateway.pending_count(), 0);
    assert!(gateway.leases().active(Utc::now()).is_empty());

    let err = gateway
        .resolve(respond(&prompt.request_id, Decision::Approved, "alice"))
        .expect_err("should fail");
    assert!(matches!(
        err,
        ApprovalError::AlreadyResolved {
            decision: Decision::Expired,
            ..
        }
    ));
}

#[tokio::test]
async fn second_response_is_rejected() {
    let (gateway, mut rx) = gateway(ApprovalConfig::default());
    let (handle, prompt) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;
    gateway
        .resolve(respond(&prompt.request_id, Decision::Approved, "alice"))
        .expect("resolve");
    let err = gateway
        .resolve(respond(&prompt.request_id, Decision::Denied, "bob"))
        .expect_err("should fail");
    assert!(matches!(
        err,
        ApprovalError::AlreadyResolved {
            decision: Decision::Approved,
            ..
        }
    ));
    assert!(handle.await.expect("join").is_granted());
    assert_eq!(
        gateway.get(&prompt.request_id).expect("stored").decision,
        Decision::Approved
    );
}

#[tokio::test]
async fn unknown_and_non_terminal_responses_are_rejected() {
    let (gateway, _rx) = gateway(ApprovalConfig::default());
    let err = gateway
        .resolve(respond("nosuchid", Decision::Approved, "alice"))
        .expect_err("should fail");
    assert!(matches!(err, ApprovalError::NotFound(_)));

    let err = gateway
        .resolve(respond("nosuchid", Decision::Expired, "alice"))
        .expect_err("should fail");
    assert!(matches!(err, ApprovalError::InvalidDecision(Decision::Expired)));
}

#[tokio::test]
async fn promotion_only_accepts_listed_approvers() {
    let config = ApprovalConfig {
        promotion_approvers: vec!["security-lead".to_owned()],
        ..ApprovalConfig::default()
    };
    let (gateway, mut rx) = gateway(config);
    let gw = Arc::clone(&gateway);
    let handle = tokio::spawn(async move {
        gw.request_promotion(&skill(), "promote arxiv-search", &scope())
            .await
    });
    let prompt = rx.recv().await.expect("prompt delivered");
    assert_eq!(prompt.kind, ApprovalKind::Promotion);
    assert_eq!(prompt.risk_level, RiskLevel::High);

    let err = gateway
        .resolve(respond(&prompt.request_id, Decision::Approved, "intern"))
        .expect_err("should fail");
    assert!(matches!(err, ApprovalError::Unauthorized { .. }));
    let err = gateway
        .resolve(respond(&prompt.request_id, Decision::Approved, "  "))
        .expect_err("should fail");
    assert!(matches!(err, ApprovalError::Unauthorized { .. }));
    assert_eq!(gateway.pending_count(), 1);

    gateway
        .resolve(respond(&prompt.request_id, Decision::Approved, "security-lead"))
        .expect("resolve");
    let request = handle.await.expect("join");
    assert_eq!(request.decision, Decision::Approved);
    assert_eq!(request.approver.as_deref(), Some("security-lead"));
    assert!(gateway.leases().active(Utc::now()).is_empty());
}

#[tokio::test]
async fn undeliverable_prompt_expires_immediately() {
    let gateway = ApprovalGateway::new(Arc::new(BrokenChannel), ApprovalConfig::default());
    let auth = gateway
        .authorize(&skill(), "run `curl`", RiskLevel::High, &scope())
        .await;
    assert!(matches!(auth, Authorization::Expired(_)));
    assert_eq!(gateway.pending_count(), 0);
}

#[tokio::test]
async fn cancelled_wait_expires_the_request() {
    let (gateway, mut rx) = gateway(ApprovalConfig::default());
    let (handle, prompt) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;
    assert_eq!(gateway.pending_count(), 1);

    handle.abort();
    assert!(handle.await.expect_err("should fail").is_cancelled());

    assert_eq!(gateway.pending_count(), 0);
    let request = gateway.get(&prompt.request_id).expect("stored");
    assert_eq!(request.decision, Decision::Expired);
}

#[tokio::test]
async fn pruning_forgets_old_decisions() {
    let (gateway, mut rx) = gateway(ApprovalConfig::default());
    let (handle, prompt) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;
    gateway
        .resolve(respond(&prompt.request_id, Decision::Denied, "bob"))
        .expect("resolve");
    handle.await.expect("join");

    gateway.prune_resolved(Utc::now().checked_add_signed(chrono::Duration::seconds(1)).expect("time"));
    assert!(gateway.get(&prompt.request_id).is_none());
}

#[tokio::test]
async fn new_requests_forget_decisions_past_retention() {
    let config = ApprovalConfig {
        resolved_retention_secs: 0,
        ..ApprovalConfig::default()
    };
    let (gateway, mut rx) = gateway(config);
    let (handle, first) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;
    gateway
        .resolve(respond(&first.request_id, Decision::Denied, "bob"))
        .expect("resolve");
    handle.await.expect("join");
    assert!(gateway.get(&first.request_id).is_some());

    let (handle, second) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;
    assert!(gateway.get(&first.request_id).is_none());
    assert!(gateway.get(&second.request_id).is_some());
    handle.abort();
}

#[tokio::test]
async fn pump_applies_channel_responses() {
    let (gateway, mut rx) = gateway(ApprovalConfig::default());
    let (responses, inbox) = mpsc::channel(4);
    let pump = tokio::spawn(skillgate::approval::channel::pump(Arc::clone(&gateway), inbox));

    let (handle, prompt) = pending_authorization(&gateway, &mut rx, RiskLevel::Medium).await;
    let line = format!("a:{}", prompt.request_id);
    let response = skillgate::approval::channel::parse_callback(&line, "alice").expect("callback");
    responses.send(response).await.expect("send");

    assert!(matches!(handle.await.expect("join"), Authorization::Approved(_)));
    drop(responses);
    pump.await.expect("pump ends when senders close");
}
