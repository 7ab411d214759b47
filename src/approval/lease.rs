//! Time-bounded session leases.
//!
//! An approved action request grants a lease scoped to the requesting user
//! and project. While it is active, later actions of equal or lower risk in
//! the same scope skip the prompt. Expiry is evaluated at check time; there
//! is no background sweeper.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::RiskLevel;

/// Who an action is performed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    /// Requesting user.
    pub user_id: String,
    /// Project the action belongs to.
    pub project_scope: String,
}

impl Scope {
    /// Build a scope.
    pub fn new(user_id: impl Into<String>, project_scope: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_scope: project_scope.into(),
        }
    }
}

/// A grant derived from an approved request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLease {
    /// User the lease was granted to.
    pub user_id: String,
    /// Project the lease covers.
    pub project_scope: String,
    /// Grant time.
    pub granted_at: DateTime<Utc>,
    /// End of the window (exclusive).
    pub expires_at: DateTime<Utc>,
    /// Highest risk level the lease covers.
    pub max_risk: RiskLevel,
    /// Approval request the lease came from.
    pub approval_id: String,
}

impl SessionLease {
    /// Whether the lease still has authority at `at`.
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        at < self.expires_at
    }

    /// Whether the lease authorises an action of `risk` in `scope` at `at`.
    pub fn covers(&self, scope: &Scope, risk: RiskLevel, at: DateTime<Utc>) -> bool {
        self.is_active(at)
            && self.user_id == scope.user_id
            && self.project_scope == scope.project_scope
            && risk <= self.max_risk
    }
}

/// Concurrent lease lookups keyed by scope.
#[derive(Debug, Default)]
pub struct LeaseStore {
    leases: RwLock<HashMap<Scope, SessionLease>>,
}

impl LeaseStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant (or refresh) the lease for `scope`.
    ///
    /// A refresh keeps the higher of the old and new risk ceilings while the
    /// old lease is still active.
    pub fn grant(
        &self,
        scope: &Scope,
        risk: RiskLevel,
        approval_id: &str,
        now: DateTime<Utc>,
        minutes: i64,
    ) -> SessionLease {
        let expires_at = now
            .checked_add_signed(Duration::minutes(minutes.max(0)))
            .unwrap_or(now);
        let mut leases = self.leases.write().unwrap_or_else(PoisonError::into_inner);
        let max_risk = leases
            .get(scope)
            .filter(|old| old.is_active(now))
            .map_or(risk, |old| old.max_risk.max(risk));
        let lease = SessionLease {
            user_id: scope.user_id.clone(),
            project_scope: scope.project_scope.clone(),
            granted_at: now,
            expires_at,
            max_risk,
            approval_id: approval_id.to_owned(),
        };
        leases.insert(scope.clone(), lease.clone());
        lease
    }

    /// The lease held for `scope`, active or not.
    pub fn get(&self, scope: &Scope) -> Option<SessionLease> {
        let leases = self.leases.read().unwrap_or_else(PoisonError::into_inner);
        leases.get(scope).cloned()
    }

    /// Reinstate a previously granted lease, e.g. one read back from the
    /// ledger. A lease that expires later than the one already held wins.
    pub fn restore(&self, lease: SessionLease) {
        let scope = Scope::new(lease.user_id.clone(), lease.project_scope.clone());
        let mut leases = self.leases.write().unwrap_or_else(PoisonError::into_inner);
        let newer = leases
            .get(&scope)
            .map_or(true, |held| held.expires_at < lease.expires_at);
        if newer {
            leases.insert(scope, lease);
        }
    }

    /// The active lease covering an action, if any.
    pub fn covers(&self, scope: &Scope, risk: RiskLevel, at: DateTime<Utc>) -> Option<SessionLease> {
        let leases = self.leases.read().unwrap_or_else(PoisonError::into_inner);
        leases
            .get(scope)
            .filter(|lease| lease.covers(scope, risk, at))
            .cloned()
    }

    /// All leases still active at `at`.
    pub fn active(&self, at: DateTime<Utc>) -> Vec<SessionLease> {
        let leases = self.leases.read().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<SessionLease> = leases
            .values()
            .filter(|lease| lease.is_active(at))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        active
    }

    /// Drop the lease for `scope`. Returns whether one existed.
    pub fn revoke(&self, scope: &Scope) -> bool {
        let mut leases = self.leases.write().unwrap_or_else(PoisonError::into_inner);
        leases.remove(scope).is_some()
    }
}
