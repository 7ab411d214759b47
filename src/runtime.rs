//! Skill runtime: the trust lifecycle wired end to end.
//!
//! A run request flows through the ledger state check (auditing first when
//! the skill is new or its source changed), policy classification, the
//! approval gateway (unless a lease covers the action), the executor chosen
//! by trust state, and finally back into the ledger.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::approval::{ApprovalGateway, ApprovalRequest, Authorization, Decision, Scope};
use crate::audit::{AuditError, AuditedSkill, Auditor, RiskReport};
use crate::config::{BusyPolicy, Config};
use crate::executor::{self, render_command, Execution, Executor, ExecutorError, SkillInput};
use crate::ledger::store::HistoryEntry;
use crate::ledger::{LedgerError, SkillGuard, SkillRecord, TrustLedger, TrustState};
use crate::policy::{Action, PolicyEngine, RiskLevel};
use crate::skill::{Skill, SkillId};

/// Base delay between retries of a sandbox fault; grows linearly.
const FAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Runtime errors surfaced to callers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The skill could not be audited; it stays unaudited.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Ledger failure, including `Busy` and `TrustStateConflict`.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Executor failure after retries.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The skill directory now declares a different skill.
    #[error("skill directory for {expected} now declares {found}")]
    IdentityMismatch {
        /// Installed skill.
        expected: SkillId,
        /// Skill found on disk.
        found: SkillId,
    },

    /// The skill is quarantined and needs a manual review.
    #[error("skill {0} is quarantined")]
    Quarantined(SkillId),

    /// The skill is in a state that does not allow the operation.
    #[error("skill {skill} is {state}")]
    NotExecutable {
        /// Skill.
        skill: SkillId,
        /// Current state.
        state: TrustState,
    },

    /// Nobody answered the approval request in time.
    #[error("approval expired")]
    ApprovalTimeout {
        /// Skill whose action was denied.
        skill: SkillId,
        /// Expired request id.
        request_id: String,
    },

    /// A human denied the request.
    #[error("approval denied by {approver}")]
    ApprovalDenied {
        /// Skill whose action was denied.
        skill: SkillId,
        /// Who denied it.
        approver: String,
    },
}

/// Result of installing or re-auditing a skill.
#[derive(Debug, Clone)]
pub struct Installed {
    /// Ledger row after the audit.
    pub record: SkillRecord,
    /// Report for the installed source version.
    pub report: RiskReport,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Invocation and captured output.
    pub execution: Execution,
    /// Ledger row after the invocation was recorded.
    pub record: SkillRecord,
    /// How the action was authorised.
    pub authorization: Authorization,
    /// Risk the policy engine assigned.
    pub risk: RiskLevel,
}

/// Current view of one skill.
#[derive(Debug, Clone)]
pub struct SkillStatus {
    /// Ledger row.
    pub record: SkillRecord,
    /// Latest risk report.
    pub report: Option<RiskReport>,
}

/// Orchestrates audit, policy, approval, execution and the ledger.
pub struct SkillRuntime {
    config: Config,
    auditor: Auditor,
    policy: PolicyEngine,
    ledger: Arc<TrustLedger>,
    approvals: Arc<ApprovalGateway>,
    sandbox: Arc<dyn Executor>,
    host: Arc<dyn Executor>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for SkillRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRuntime")
            .field("ledger", &self.ledger)
            .field("permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl SkillRuntime {
    /// Wire a runtime from its collaborators.
    pub fn new(
        config: Config,
        ledger: Arc<TrustLedger>,
        approvals: Arc<ApprovalGateway>,
        sandbox: Arc<dyn Executor>,
        host: Arc<dyn Executor>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.sandbox.max_concurrent.max(1)));
        Self {
            auditor: Auditor::new(config.audit.clone()),
            policy: PolicyEngine::new(),
            config,
            ledger,
            approvals,
            sandbox,
            host,
            permits,
        }
    }

    /// Trust ledger.
    pub fn ledger(&self) -> &TrustLedger {
        &self.ledger
    }

    /// Policy engine holding every loaded skill's profile.
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Approval gateway.
    pub fn approvals(&self) -> &ApprovalGateway {
        &self.approvals
    }

    /// Audit a skill directory and record it in the ledger.
    ///
    /// Installing an unchanged source again is a no-op; a changed source
    /// starts a new epoch.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Audit`] when the manifest or sources cannot be
    /// read; nothing is recorded in that case.
    pub async fn install(&self, root: &Path, actor: &str) -> Result<Installed, RuntimeError> {
        let AuditedSkill { skill, report } = self.auditor.audit_dir(root)?;
        let guard = self.ledger.acquire(&skill.id).await;
        let mut record = self.ledger.register(&guard, &skill, actor).await?;
        if record.state == TrustState::Unaudited {
            record = self.ledger.record_audit(&guard, &report, actor).await?;
        }
        self.register_policy(&skill);
        info!(
            skill = %skill.id,
            state = %record.state,
            label = %report.label(),
            findings = report.findings.len(),
            "skill installed"
        );
        Ok(Installed { record, report })
    }

    /// Re-audit an installed skill from its source directory.
    ///
    /// The skill restarts as `Unaudited` in a new epoch; a quarantine is held.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Audit`] if the source cannot be audited; the
    /// ledger is left untouched in that case.
    pub async fn reaudit(&self, skill_id: &SkillId, actor: &str) -> Result<Installed, RuntimeError> {
        let record = self.ledger.require(skill_id).await?;
        let audited = self.audit_installed(&record)?;
        let guard = self.ledger.acquire(skill_id).await;
        let record = self
            .reset_and_audit(&guard, &audited, actor, "requested")
            .await?;
        self.register_policy(&audited.skill);
        Ok(Installed {
            record,
            report: audited.report,
        })
    }

    /// Reinstate session leases persisted by earlier processes.
    ///
    /// Returns the number of active leases restored.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Ledger`] when the leases cannot be read.
    pub async fn restore_leases(&self) -> Result<usize, RuntimeError> {
        let leases = self.ledger.active_leases(Utc::now()).await?;
        let restored = leases.len();
        for lease in leases {
            self.approvals.leases().restore(lease);
        }
        if restored > 0 {
            info!(leases = restored, "session leases restored");
        }
        Ok(restored)
    }

    /// Load every installed skill's profile into the policy engine.
    ///
    /// Skills whose source changed on disk are re-audited. Returns the number
    /// of skills loaded.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the skill list cannot be read. Individual
    /// skills that fail to audit are skipped with a warning.
    pub async fn load_installed(&self) -> Result<usize, RuntimeError> {
        let mut loaded: usize = 0;
        for record in self.ledger.records().await? {
            let audited = match self.audit_installed(&record) {
                Ok(audited) => audited,
                Err(e) => {
                    warn!(skill = %record.id, error = %e, "installed skill could not be loaded");
                    continue;
                }
            };
            if audited.skill.source_digest != record.source_digest
                || record.state == TrustState::Unaudited
            {
                let guard = self.ledger.acquire(&record.id).await;
                self.bring_current(&guard, &audited, &record, "system").await?;
            }
            self.register_policy(&audited.skill);
            loaded = loaded.saturating_add(1);
        }
        Ok(loaded)
    }

    /// Run one declared command of a skill.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Quarantined`] or
    /// [`RuntimeError::NotExecutable`] when the state forbids execution,
    /// [`RuntimeError::ApprovalTimeout`] or [`RuntimeError::ApprovalDenied`]
    /// when the approval gate does not pass (no trust effect), and
    /// `Ledger(Busy)` under the reject policy when the skill is already
    /// running. Policy violations are not errors: they come back as a flagged
    /// invocation in the outcome.
    pub async fn run(
        &self,
        skill_id: &SkillId,
        input: &SkillInput,
        scope: &Scope,
    ) -> Result<RunOutcome, RuntimeError> {
        let guard = match self.config.sandbox.busy {
            BusyPolicy::Wait => self.ledger.acquire(skill_id).await,
            BusyPolicy::Reject => self.ledger.try_acquire(skill_id)?,
        };

        let record = self.ledger.require(skill_id).await?;
        let audited = self.audit_installed(&record)?;
        let record = self.bring_current(&guard, &audited, &record, "system").await?;
        let skill = audited.skill;
        self.register_policy(&skill);

        match record.state {
            TrustState::Quarantined => {
                warn!(skill = %skill_id, "run refused: skill is quarantined");
                return Err(RuntimeError::Quarantined(skill_id.clone()));
            }
            state if !state.is_executable() => {
                return Err(RuntimeError::NotExecutable {
                    skill: skill_id.clone(),
                    state,
                });
            }
            _ => {}
        }

        let spec = skill.manifest.command(&input.command).ok_or_else(|| {
            ExecutorError::InvalidInput(format!(
                "skill '{}' declares no command '{}'",
                skill.id, input.command
            ))
        })?;
        let command = render_command(spec, &input.args)?;
        let action = Action::RunCommand { command };
        let risk = self.policy.classify(skill_id, &action);

        let authorization = self
            .approvals
            .authorize(skill_id, &action.to_string(), risk, scope)
            .await;
        if let Some(request) = authorization.request() {
            self.ledger.record_approval(request).await?;
        }
        if matches!(authorization, Authorization::Approved(_)) {
            if let Some(lease) = self.approvals.leases().get(scope) {
                self.ledger.record_lease(&lease).await?;
            }
        }
        check_granted(skill_id, &authorization)?;

        let executor = if record.state.runs_on_host() {
            Arc::clone(&self.host)
        } else {
            Arc::clone(&self.sandbox)
        };

        let execution = {
            let _permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| ExecutorError::SandboxFault("executor shut down".to_owned()))?;
            self.execute_with_retry(executor.as_ref(), &skill, input).await?
        };

        let record = self
            .ledger
            .record_invocation(&guard, &execution.invocation)
            .await?;
        Ok(RunOutcome {
            execution,
            record,
            authorization,
            risk,
        })
    }

    /// Ask a human to promote a `PendingPromotion` skill to host execution.
    ///
    /// The skill is not locked while waiting; the promotion re-checks the
    /// state, so a skill quarantined in the meantime is not promoted.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotExecutable`] unless the skill is
    /// `PendingPromotion`, or the approval errors of [`Self::run`].
    pub async fn request_promotion(
        &self,
        skill_id: &SkillId,
        scope: &Scope,
    ) -> Result<SkillRecord, RuntimeError> {
        let record = self.ledger.require(skill_id).await?;
        if record.state != TrustState::PendingPromotion {
            return Err(RuntimeError::NotExecutable {
                skill: skill_id.clone(),
                state: record.state,
            });
        }

        let description = format!(
            "promote to host execution after {} consecutive clean runs (source {})",
            record.clean_runs,
            short_digest(&record.source_digest)
        );
        let request = self
            .approvals
            .request_promotion(skill_id, &description, scope)
            .await;
        self.ledger.record_approval(&request).await?;

        let approver = approved_by(skill_id, &request)?;
        let guard = self.ledger.acquire(skill_id).await;
        let current = self.ledger.require(skill_id).await?;
        if current.source_digest != record.source_digest || current.epoch != record.epoch {
            warn!(skill = %skill_id, "source changed while promotion was pending");
            return Err(RuntimeError::NotExecutable {
                skill: skill_id.clone(),
                state: current.state,
            });
        }
        Ok(self
            .ledger
            .approve_promotion(&guard, &approver, &request.id)
            .await?)
    }

    /// Release a quarantined skill after a human review.
    ///
    /// # Errors
    ///
    /// Returns a ledger error unless the skill is `Quarantined`.
    pub async fn review(
        &self,
        skill_id: &SkillId,
        reviewer: &str,
        note: &str,
    ) -> Result<SkillRecord, RuntimeError> {
        let guard = self.ledger.acquire(skill_id).await;
        Ok(self.ledger.manual_review(&guard, reviewer, note).await?)
    }

    /// Current state and latest report of a skill.
    ///
    /// # Errors
    ///
    /// Returns `Ledger(UnknownSkill)` for a skill that is not installed.
    pub async fn status(&self, skill_id: &SkillId) -> Result<SkillStatus, RuntimeError> {
        let record = self.ledger.require(skill_id).await?;
        let report = self.ledger.latest_report(skill_id).await?;
        Ok(SkillStatus { record, report })
    }

    /// Invocation log of a skill, newest first.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the log cannot be read.
    pub async fn history(
        &self,
        skill_id: &SkillId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, RuntimeError> {
        Ok(self.ledger.history(skill_id, limit).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn audit_installed(&self, record: &SkillRecord) -> Result<AuditedSkill, RuntimeError> {
        let audited = self.auditor.audit_dir(Path::new(&record.root))?;
        if audited.skill.id != record.id {
            return Err(RuntimeError::IdentityMismatch {
                expected: record.id.clone(),
                found: audited.skill.id,
            });
        }
        Ok(audited)
    }

    /// Make sure the ledger has a report for the source version on disk.
    async fn bring_current(
        &self,
        guard: &SkillGuard,
        audited: &AuditedSkill,
        record: &SkillRecord,
        actor: &str,
    ) -> Result<SkillRecord, RuntimeError> {
        if audited.skill.source_digest != record.source_digest {
            info!(skill = %record.id, "source changed on disk, re-auditing");
            return self
                .reset_and_audit(guard, audited, actor, "source changed")
                .await;
        }
        if record.state == TrustState::Unaudited {
            return Ok(self
                .ledger
                .record_audit(guard, &audited.report, actor)
                .await?);
        }
        Ok(record.clone())
    }

    async fn reset_and_audit(
        &self,
        guard: &SkillGuard,
        audited: &AuditedSkill,
        actor: &str,
        reason: &str,
    ) -> Result<SkillRecord, RuntimeError> {
        self.ledger
            .reset(guard, &audited.skill, actor, reason)
            .await?;
        Ok(self
            .ledger
            .record_audit(guard, &audited.report, actor)
            .await?)
    }

    fn register_policy(&self, skill: &Skill) {
        let templates = skill
            .manifest
            .commands
            .iter()
            .map(|c| c.template.clone())
            .collect();
        self.policy
            .register(&skill.id, skill.profile().clone(), templates);
    }

    async fn execute_with_retry(
        &self,
        executor: &dyn Executor,
        skill: &Skill,
        input: &SkillInput,
    ) -> Result<Execution, RuntimeError> {
        let retries = self.config.sandbox.fault_retries;
        let mut attempt: u32 = 0;
        loop {
            match executor::execute(executor, skill, input, &self.policy).await {
                Ok(execution) => return Ok(execution),
                Err(ExecutorError::SandboxFault(reason)) if attempt < retries => {
                    attempt = attempt.saturating_add(1);
                    let delay = FAULT_BACKOFF.saturating_mul(attempt);
                    warn!(
                        skill = %skill.id,
                        attempt,
                        retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "sandbox fault, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn check_granted(skill_id: &SkillId, authorization: &Authorization) -> Result<(), RuntimeError> {
    match authorization {
        Authorization::NotRequired | Authorization::Leased(_) | Authorization::Approved(_) => Ok(()),
        Authorization::Denied(request) => {
            warn!(skill = %skill_id, id = %request.id, risk = %request.risk_level, "action denied by approver");
            Err(RuntimeError::ApprovalDenied {
                skill: skill_id.clone(),
                approver: request.approver.clone().unwrap_or_default(),
            })
        }
        Authorization::Expired(request) => {
            warn!(skill = %skill_id, id = %request.id, risk = %request.risk_level, "action denied: approval expired");
            Err(RuntimeError::ApprovalTimeout {
                skill: skill_id.clone(),
                request_id: request.id.clone(),
            })
        }
    }
}

fn approved_by(skill_id: &SkillId, request: &ApprovalRequest) -> Result<String, RuntimeError> {
    match request.decision {
        Decision::Approved => Ok(request.approver.clone().unwrap_or_default()),
        Decision::Denied => Err(RuntimeError::ApprovalDenied {
            skill: skill_id.clone(),
            approver: request.approver.clone().unwrap_or_default(),
        }),
        Decision::Pending | Decision::Expired => Err(RuntimeError::ApprovalTimeout {
            skill: skill_id.clone(),
            request_id: request.id.clone(),
        }),
    }
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
