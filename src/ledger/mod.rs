//! Trust ledger: per-skill lifecycle state and invocation history.
//!
//! The ledger is the single source of truth for "may this skill run, and
//! where". All writes for one skill go through a [`SkillGuard`], an
//! in-process per-skill async lock. Each update also checks the row's
//! `version` column, so a writer that lost a race (for example a second
//! process on the same database) fails with
//! [`LedgerError::TrustStateConflict`] instead of merging.

pub mod state;
pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::ExecutorKind;
use crate::skill::SkillId;

pub use self::state::{Step, TrustState, TrustStatus};
pub use self::store::{SkillGuard, TrustLedger};

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Outcome of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Exit code 0 within all ceilings.
    Success,
    /// Non-zero exit within all ceilings.
    Failure,
    /// Terminated for breaching policy.
    PolicyViolation,
}

impl Outcome {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::PolicyViolation => "policy_violation",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised outcome.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "policy_violation" => Ok(Self::PolicyViolation),
            other => Err(LedgerError::InvalidEnum {
                field: "outcome",
                value: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One entry of the append-only invocation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Invocation identifier.
    pub id: String,
    /// Skill that ran.
    pub skill_id: SkillId,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
    /// Outcome.
    pub outcome: Outcome,
    /// Whether the run breached policy.
    pub flagged: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Declared command name.
    pub command: String,
    /// Where it ran.
    pub executor: ExecutorKind,
    /// Violation or failure detail.
    pub detail: Option<String>,
}

/// Current ledger row for a skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillRecord {
    /// Skill identifier.
    pub id: SkillId,
    /// Host path of the skill source.
    pub root: String,
    /// Digest of the source version the state applies to.
    pub source_digest: String,
    /// Lifecycle state.
    pub state: TrustState,
    /// Trailing run of unflagged successes.
    pub clean_runs: u32,
    /// Incremented on every re-audit reset.
    pub epoch: i64,
    /// Optimistic concurrency version.
    pub version: i64,
    /// Last change.
    pub updated_at: String,
}

impl SkillRecord {
    /// State and counter pair.
    pub fn status(&self) -> TrustStatus {
        TrustStatus {
            state: self.state,
            clean_runs: self.clean_runs,
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    /// Skill identifier.
    pub skill_id: SkillId,
    /// Epoch the change happened in.
    pub epoch: i64,
    /// State before.
    pub from: TrustState,
    /// State after.
    pub to: TrustState,
    /// Who or what caused it.
    pub actor: String,
    /// Why.
    pub reason: String,
    /// When (RFC 3339).
    pub created_at: String,
}

/// Irreversible promotion audit-trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionRecord {
    /// Promoted skill.
    pub skill_id: SkillId,
    /// Source version that was promoted.
    pub source_digest: String,
    /// Approving identity.
    pub approver: String,
    /// Approval request that authorised it.
    pub approval_id: String,
    /// When (RFC 3339).
    pub promoted_at: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from trust ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The schema migration failed.
    #[error("failed to apply ledger schema: {0}")]
    Migration(String),

    /// A stored report could not be (de)serialised.
    #[error("report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No ledger row for the skill.
    #[error("unknown skill: {0}")]
    UnknownSkill(SkillId),

    /// The event is not valid in the current state.
    #[error("{event} is not allowed while {from}")]
    InvalidTransition {
        /// State at the time of the event.
        from: TrustState,
        /// Rejected event.
        event: &'static str,
    },

    /// Another writer changed the skill first.
    #[error("trust state conflict on {0}: concurrent update rejected")]
    TrustStateConflict(SkillId),

    /// The skill already has an invocation in flight.
    #[error("skill {0} is busy")]
    Busy(SkillId),

    /// A write was attempted with a guard for another skill.
    #[error("writer guard for {guard} used on {target}")]
    GuardMismatch {
        /// Skill the guard locks.
        guard: SkillId,
        /// Skill the write targeted.
        target: SkillId,
    },

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },
}
