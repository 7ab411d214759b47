//! Trust state machine.
//!
//! Pure transition rules; the store applies them under the per-skill writer
//! lock and persists the result.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{LedgerError, Outcome};

/// Lifecycle state of a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// No risk report for the current source version.
    Unaudited,
    /// Audited; runs only inside the sandbox.
    Sandboxed,
    /// Clean streak reached; waiting for a human to approve promotion.
    PendingPromotion,
    /// Promoted; runs on the host.
    Trusted,
    /// Blocked until a manual review.
    Quarantined,
}

impl TrustState {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unaudited => "unaudited",
            Self::Sandboxed => "sandboxed",
            Self::PendingPromotion => "pending_promotion",
            Self::Trusted => "trusted",
            Self::Quarantined => "quarantined",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised state.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "unaudited" => Ok(Self::Unaudited),
            "sandboxed" => Ok(Self::Sandboxed),
            "pending_promotion" => Ok(Self::PendingPromotion),
            "trusted" => Ok(Self::Trusted),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(LedgerError::InvalidEnum {
                field: "state",
                value: other.to_owned(),
            }),
        }
    }

    /// Whether a skill in this state may be executed at all.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Sandboxed | Self::PendingPromotion | Self::Trusted)
    }

    /// Whether executions in this state run on the host.
    pub fn runs_on_host(&self) -> bool {
        matches!(self, Self::Trusted)
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// State plus the clean-run counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustStatus {
    /// Lifecycle state.
    pub state: TrustState,
    /// Trailing run of unflagged `Success` invocations.
    pub clean_runs: u32,
}

/// Result of applying an event: the new status and a reason for the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Status after the event.
    pub status: TrustStatus,
    /// Human-readable cause, recorded when the state changes.
    pub reason: String,
}

impl TrustStatus {
    /// Fresh status of a newly installed or re-audited skill.
    pub fn unaudited() -> Self {
        Self {
            state: TrustState::Unaudited,
            clean_runs: 0,
        }
    }

    /// Apply a completed audit.
    ///
    /// `hold_quarantine` keeps a skill quarantined across a re-audit: a
    /// source update alone never lifts a quarantine.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the skill is
    /// `Unaudited`.
    pub fn apply_audit(self, has_high: bool, hold_quarantine: bool) -> Result<Step, LedgerError> {
        self.expect(&[TrustState::Unaudited], "audit")?;
        let (state, reason) = if has_high {
            (TrustState::Quarantined, "audit reported a high-severity finding")
        } else if hold_quarantine {
            (TrustState::Quarantined, "quarantine held across re-audit")
        } else {
            (TrustState::Sandboxed, "audit passed without high-severity findings")
        };
        Ok(Step {
            status: Self {
                state,
                clean_runs: 0,
            },
            reason: reason.to_owned(),
        })
    }

    /// Apply a recorded invocation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] when the skill is not in an
    /// executable state.
    pub fn apply_invocation(
        self,
        outcome: Outcome,
        flagged: bool,
        threshold: u32,
    ) -> Result<Step, LedgerError> {
        self.expect(
            &[
                TrustState::Sandboxed,
                TrustState::PendingPromotion,
                TrustState::Trusted,
            ],
            "invocation",
        )?;

        if flagged || outcome == Outcome::PolicyViolation {
            let reason = if self.state == TrustState::Trusted {
                "flagged invocation while trusted"
            } else {
                "flagged invocation in sandbox"
            };
            return Ok(Step {
                status: Self {
                    state: TrustState::Quarantined,
                    clean_runs: 0,
                },
                reason: reason.to_owned(),
            });
        }

        if outcome == Outcome::Failure {
            return Ok(Step {
                status: Self {
                    state: self.state,
                    clean_runs: 0,
                },
                reason: "failed invocation ended the clean streak".to_owned(),
            });
        }

        let clean_runs = self.clean_runs.saturating_add(1);
        if self.state == TrustState::Sandboxed && clean_runs >= threshold {
            return Ok(Step {
                status: Self {
                    state: TrustState::PendingPromotion,
                    clean_runs,
                },
                reason: format!("{clean_runs} consecutive clean runs"),
            });
        }
        Ok(Step {
            status: Self {
                state: self.state,
                clean_runs,
            },
            reason: "clean run".to_owned(),
        })
    }

    /// Apply an approved promotion.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the skill is
    /// `PendingPromotion`.
    pub fn apply_promotion(self) -> Result<Step, LedgerError> {
        self.expect(&[TrustState::PendingPromotion], "promotion")?;
        Ok(Step {
            status: Self {
                state: TrustState::Trusted,
                clean_runs: self.clean_runs,
            },
            reason: "promotion approved".to_owned(),
        })
    }

    /// Apply a manual review of a quarantined skill.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the skill is
    /// `Quarantined`.
    pub fn apply_review(self) -> Result<Step, LedgerError> {
        self.expect(&[TrustState::Quarantined], "manual review")?;
        Ok(Step {
            status: Self {
                state: TrustState::Sandboxed,
                clean_runs: 0,
            },
            reason: "manual review released quarantine".to_owned(),
        })
    }

    fn expect(self, allowed: &[TrustState], event: &'static str) -> Result<(), LedgerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LedgerError::InvalidTransition {
                from: self.state,
                event,
            })
        }
    }
}
