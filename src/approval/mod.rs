//! Human-in-the-loop approval gateway.
//!
//! Sensitive actions are held until a human answers through an
//! [`ApprovalChannel`]. Each request gets a short base62 identifier, waits
//! asynchronously with a deadline, and ends in exactly one terminal decision.
//! Expiry, channel failure and cancellation of the waiting caller all
//! resolve to [`Decision::Expired`], which denies the action without
//! touching the skill's trust state.
//!
//! An approved per-action request grants a [`SessionLease`]; promotion
//! requests never grant or consume one.

pub mod channel;
pub mod lease;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::ApprovalConfig;
use crate::policy::RiskLevel;
use crate::skill::SkillId;

pub use self::channel::{ApprovalChannel, ApprovalPrompt, ApprovalResponse, ConsoleChannel};
pub use self::lease::{LeaseStore, Scope, SessionLease};

/// Length of generated approval identifiers.
const APPROVAL_ID_LEN: usize = 8;

/// Base62 alphabet used for approval IDs.
const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What an approval request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// A single sensitive action.
    Action,
    /// Promotion of a skill to host execution.
    Promotion,
}

impl ApprovalKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Promotion => "promotion",
        }
    }
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Waiting for a human.
    Pending,
    /// Approved.
    Approved,
    /// Denied.
    Denied,
    /// No valid answer before the deadline.
    Expired,
}

impl Decision {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    /// Whether the decision is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Short base62 identifier.
    pub id: String,
    /// Skill that triggered the request.
    pub skill_id: SkillId,
    /// Per-action or promotion.
    pub kind: ApprovalKind,
    /// Human-readable action.
    pub action_description: String,
    /// Classified risk.
    pub risk_level: RiskLevel,
    /// User and project the action runs for.
    pub requester: Scope,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Deadline.
    pub expires_at: DateTime<Utc>,
    /// Current decision.
    pub decision: Decision,
    /// Who decided, when a human did.
    pub approver: Option<String>,
    /// When the decision became terminal.
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Outbound prompt for the channel.
    pub fn prompt(&self) -> ApprovalPrompt {
        ApprovalPrompt {
            request_id: self.id.clone(),
            skill_name: self.skill_id.to_string(),
            action_description: self.action_description.clone(),
            risk_level: self.risk_level,
            expires_at: self.expires_at,
            kind: self.kind,
        }
    }

    fn finalize(mut self, decision: Decision, approver: Option<String>, at: DateTime<Utc>) -> Self {
        self.decision = decision;
        self.approver = approver;
        self.decided_at = Some(at);
        self
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The action is below the approval threshold.
    NotRequired,
    /// An active lease covered the action.
    Leased(SessionLease),
    /// A human approved the action.
    Approved(ApprovalRequest),
    /// A human denied the action.
    Denied(ApprovalRequest),
    /// Nobody answered in time.
    Expired(ApprovalRequest),
}

impl Authorization {
    /// Whether the action may proceed.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::NotRequired | Self::Leased(_) | Self::Approved(_))
    }

    /// The request behind the outcome, when one was raised.
    pub fn request(&self) -> Option<&ApprovalRequest> {
        match self {
            Self::Approved(r) | Self::Denied(r) | Self::Expired(r) => Some(r),
            Self::NotRequired | Self::Leased(_) => None,
        }
    }
}

/// Errors from resolving approval requests.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// No request with this id exists.
    #[error("approval request not found: {0}")]
    NotFound(String),

    /// The request already has a terminal decision.
    #[error("approval request {id} already resolved as {decision}")]
    AlreadyResolved {
        /// Request identifier.
        id: String,
        /// The existing decision.
        decision: Decision,
    },

    /// The responder may not decide this request.
    #[error("{approver:?} is not authorised to decide request {id}")]
    Unauthorized {
        /// Request identifier.
        id: String,
        /// Responder identity.
        approver: String,
    },

    /// A response carried a non-final decision.
    #[error("invalid response decision: {0}")]
    InvalidDecision(Decision),

    /// The channel could not deliver a prompt.
    #[error("approval channel error: {0}")]
    Channel(String),
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

struct PendingEntry {
    request: ApprovalRequest,
    reply: oneshot::Sender<ApprovalRequest>,
}

/// Mediates approvals and owns the lease store.
pub struct ApprovalGateway {
    channel: Arc<dyn ApprovalChannel>,
    config: ApprovalConfig,
    leases: LeaseStore,
    pending: Mutex<HashMap<String, PendingEntry>>,
    resolved: Mutex<HashMap<String, ApprovalRequest>>,
}

impl fmt::Debug for ApprovalGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalGateway")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Expires the request if the waiting future is dropped early.
struct PendingGuard<'a> {
    gateway: &'a ApprovalGateway,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(request) = self.gateway.expire(&self.id) {
            warn!(id = %request.id, skill = %request.skill_id, "approval wait cancelled, request expired");
        }
    }
}

impl ApprovalGateway {
    /// Create a gateway delivering prompts through `channel`.
    pub fn new(channel: Arc<dyn ApprovalChannel>, config: ApprovalConfig) -> Self {
        Self {
            channel,
            config,
            leases: LeaseStore::new(),
            pending: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Lease store consulted before prompting.
    pub fn leases(&self) -> &LeaseStore {
        &self.leases
    }

    /// Settings in use.
    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// Decide whether an action of `risk` may proceed for `scope`.
    ///
    /// Actions below the configured threshold pass; an active lease
    /// covering the risk passes without a prompt; anything else raises a
    /// request and waits for it.
    pub async fn authorize(
        &self,
        skill_id: &SkillId,
        action_description: &str,
        risk: RiskLevel,
        scope: &Scope,
    ) -> Authorization {
        if risk < self.config.threshold {
            return Authorization::NotRequired;
        }
        if let Some(lease) = self.leases.covers(scope, risk, Utc::now()) {
            info!(
                skill = %skill_id,
                risk = %risk,
                user = %scope.user_id,
                lease_expires = %lease.expires_at,
                "action covered by session lease"
            );
            return Authorization::Leased(lease);
        }

        let request = self
            .request_approval(skill_id, action_description, risk, scope)
            .await;
        match request.decision {
            Decision::Approved => Authorization::Approved(request),
            Decision::Denied => Authorization::Denied(request),
            Decision::Pending | Decision::Expired => Authorization::Expired(request),
        }
    }

    /// Raise a per-action request and wait for its decision.
    ///
    /// Approval grants a lease for the request's scope and risk.
    pub async fn request_approval(
        &self,
        skill_id: &SkillId,
        action_description: &str,
        risk: RiskLevel,
        scope: &Scope,
    ) -> ApprovalRequest {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let request = self
            .open(ApprovalKind::Action, skill_id, action_description, risk, scope, timeout)
            .await;
        if request.decision == Decision::Approved {
            let lease = self.leases.grant(
                scope,
                risk,
                &request.id,
                request.decided_at.unwrap_or_else(Utc::now),
                self.config.lease_minutes,
            );
            info!(
                user = %lease.user_id,
                project = %lease.project_scope,
                max_risk = %lease.max_risk,
                expires_at = %lease.expires_at,
                "session lease granted"
            );
        }
        request
    }

    /// Raise a promotion request and wait for its decision.
    ///
    /// Promotion requests always carry `High` risk, use the longer promotion
    /// timeout and never grant a lease.
    pub async fn request_promotion(
        &self,
        skill_id: &SkillId,
        action_description: &str,
        scope: &Scope,
    ) -> ApprovalRequest {
        let timeout = Duration::from_secs(self.config.promotion_timeout_secs);
        self.open(
            ApprovalKind::Promotion,
            skill_id,
            action_description,
            RiskLevel::High,
            scope,
            timeout,
        )
        .await
    }

    /// Apply a response from the channel.
    ///
    /// A response after the deadline resolves the request to `Expired`.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`], [`ApprovalError::AlreadyResolved`],
    /// [`ApprovalError::InvalidDecision`], or [`ApprovalError::Unauthorized`]
    /// for a promotion answered by someone outside the approver list. An
    /// unauthorised response leaves the request pending.
    pub fn resolve(&self, response: ApprovalResponse) -> Result<ApprovalRequest, ApprovalError> {
        if !matches!(response.decision, Decision::Approved | Decision::Denied) {
            return Err(ApprovalError::InvalidDecision(response.decision));
        }

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = pending.get(&response.request_id) else {
            drop(pending);
            return Err(match self.get(&response.request_id) {
                Some(request) => ApprovalError::AlreadyResolved {
                    id: request.id,
                    decision: request.decision,
                },
                None => ApprovalError::NotFound(response.request_id),
            });
        };

        if entry.request.kind == ApprovalKind::Promotion
            && !self.may_promote(&response.approver_identity)
        {
            warn!(
                id = %response.request_id,
                approver = %response.approver_identity,
                "promotion response from unauthorised approver ignored"
            );
            return Err(ApprovalError::Unauthorized {
                id: response.request_id,
                approver: response.approver_identity,
            });
        }

        let Some(entry) = pending.remove(&response.request_id) else {
            return Err(ApprovalError::NotFound(response.request_id));
        };
        drop(pending);

        let now = Utc::now();
        let decision = if now >= entry.request.expires_at {
            Decision::Expired
        } else {
            response.decision
        };
        let request = entry
            .request
            .finalize(decision, Some(response.approver_identity), now);
        self.store_resolved(&request);
        // The waiter may already be gone; the decision is recorded either way.
        let _ = entry.reply.send(request.clone());

        info!(
            id = %request.id,
            skill = %request.skill_id,
            kind = %request.kind,
            decision = %request.decision,
            approver = request.approver.as_deref().unwrap_or(""),
            "approval resolved"
        );
        Ok(request)
    }

    /// Look up a request, pending or resolved.
    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        if let Some(entry) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return Some(entry.request.clone());
        }
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of requests still waiting for a decision.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forget resolved requests decided before `before`.
    pub fn prune_resolved(&self, before: DateTime<Utc>) {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, r| r.decided_at.is_some_and(|at| at >= before));
    }

    async fn open(
        &self,
        kind: ApprovalKind,
        skill_id: &SkillId,
        action_description: &str,
        risk: RiskLevel,
        scope: &Scope,
        timeout: Duration,
    ) -> ApprovalRequest {
        let now = Utc::now();
        self.prune_expired_history(now);
        let window = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let (reply, rx) = oneshot::channel();

        let request = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let mut id = generate_base62_id();
            while pending.contains_key(&id) || self.get_resolved(&id) {
                id = generate_base62_id();
            }
            let request = ApprovalRequest {
                id: id.clone(),
                skill_id: skill_id.clone(),
                kind,
                action_description: action_description.to_owned(),
                risk_level: risk,
                requester: scope.clone(),
                created_at: now,
                expires_at: now.checked_add_signed(window).unwrap_or(now),
                decision: Decision::Pending,
                approver: None,
                decided_at: None,
            };
            pending.insert(
                id,
                PendingEntry {
                    request: request.clone(),
                    reply,
                },
            );
            request
        };

        let _guard = PendingGuard {
            gateway: self,
            id: request.id.clone(),
        };

        if let Err(e) = self.channel.send(&request.prompt()).await {
            warn!(id = %request.id, skill = %skill_id, error = %e, "approval prompt not delivered");
            return self.settle(&request);
        }
        info!(
            id = %request.id,
            skill = %skill_id,
            kind = %kind,
            risk = %risk,
            expires_at = %request.expires_at,
            "approval requested"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(_)) | Err(_) => {
                let settled = self.settle(&request);
                if settled.decision == Decision::Expired {
                    warn!(id = %settled.id, skill = %skill_id, "approval expired without a decision");
                }
                settled
            }
        }
    }

    /// Expire a request that is still pending, or return its final state.
    fn settle(&self, request: &ApprovalRequest) -> ApprovalRequest {
        self.expire(&request.id)
            .or_else(|| self.get(&request.id))
            .unwrap_or_else(|| {
                request
                    .clone()
                    .finalize(Decision::Expired, None, Utc::now())
            })
    }

    /// Drop decisions older than the configured retention.
    fn prune_expired_history(&self, now: DateTime<Utc>) {
        let retention = i64::try_from(self.config.resolved_retention_secs).unwrap_or(i64::MAX);
        let cutoff = chrono::Duration::try_seconds(retention)
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_resolved(cutoff);
    }

    fn expire(&self, id: &str) -> Option<ApprovalRequest> {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)?;
        let request = entry.request.finalize(Decision::Expired, None, Utc::now());
        self.store_resolved(&request);
        Some(request)
    }

    fn store_resolved(&self, request: &ApprovalRequest) {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.id.clone(), request.clone());
    }

    fn get_resolved(&self, id: &str) -> bool {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn may_promote(&self, approver: &str) -> bool {
        let approver = approver.trim();
        !approver.is_empty()
            && (self.config.promotion_approvers.is_empty()
                || self
                    .config
                    .promotion_approvers
                    .iter()
                    .any(|allowed| allowed == approver))
    }
}

/// Generate an 8-character base62 identifier.
fn generate_base62_id() -> String {
    let mut rng = rand::thread_rng();
    (0..APPROVAL_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..BASE62_CHARS.len());
            BASE62_CHARS.get(idx).copied().map_or('0', char::from)
        })
        .collect()
}
