//! SQLite persistence for the trust ledger.
//!
//! The schema is applied inline via `include_str!` on open. Reads go
//! straight to the pool; writes require a [`SkillGuard`] and run in a
//! transaction that bumps the skill's `version`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use super::state::{Step, TrustStatus};
use super::{
    Invocation, LedgerError, Outcome, PromotionRecord, SkillRecord, TransitionRecord, TrustState,
};
use crate::approval::{ApprovalRequest, SessionLease};
use crate::policy::RiskLevel;
use crate::audit::RiskReport;
use crate::executor::ExecutorKind;
use crate::skill::{Skill, SkillId};

const SCHEMA: &str = include_str!("../../migrations/001_schema.sql");

type SkillRow = (String, String, String, String, i64, i64, i64, String);
type InvocationRow = (
    String,
    String,
    i64,
    String,
    String,
    i64,
    i64,
    String,
    String,
    Option<String>,
);
type LeaseRow = (String, String, String, String, String, String);

/// Exclusive write access to one skill's ledger row.
///
/// Held for the whole of an invocation, so a second request for the same
/// skill waits (or is rejected as busy) instead of racing the counter.
#[derive(Debug)]
pub struct SkillGuard {
    skill_id: SkillId,
    _lock: OwnedMutexGuard<()>,
}

impl SkillGuard {
    /// Skill this guard locks.
    pub fn skill_id(&self) -> &SkillId {
        &self.skill_id
    }
}

/// One invocation together with the epoch it was recorded in.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HistoryEntry {
    /// Ledger epoch at the time of the run.
    pub epoch: i64,
    /// The invocation.
    pub invocation: Invocation,
}

/// Persistent, keyed store of skill trust state.
pub struct TrustLedger {
    pool: SqlitePool,
    locks: Mutex<HashMap<SkillId, Arc<AsyncMutex<()>>>>,
    threshold: u32,
}

impl std::fmt::Debug for TrustLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustLedger")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl TrustLedger {
    /// Open (or create) the ledger database and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path, threshold: u32) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Migration(format!(
                    "failed to create ledger directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, threshold).await
    }

    /// In-memory ledger for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn in_memory(threshold: u32) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .pragma("foreign_keys", "ON");
        // In-memory databases are per-connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, threshold).await
    }

    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Migration`] if the schema cannot be applied.
    pub async fn with_pool(pool: SqlitePool, threshold: u32) -> Result<Self, LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| LedgerError::Migration(e.to_string()))?;
        info!(threshold, "trust ledger ready");
        Ok(Self {
            pool,
            locks: Mutex::new(HashMap::new()),
            threshold,
        })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Clean runs needed for promotion eligibility.
    pub fn promotion_threshold(&self) -> u32 {
        self.threshold
    }

    // -----------------------------------------------------------------------
    // Writer discipline
    // -----------------------------------------------------------------------

    fn lock_for(&self, skill_id: &SkillId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(skill_id.clone()).or_default())
    }

    /// Wait for exclusive write access to a skill.
    pub async fn acquire(&self, skill_id: &SkillId) -> SkillGuard {
        let lock = self.lock_for(skill_id).lock_owned().await;
        SkillGuard {
            skill_id: skill_id.clone(),
            _lock: lock,
        }
    }

    /// Take exclusive write access to a skill without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Busy`] when another writer holds the skill.
    pub fn try_acquire(&self, skill_id: &SkillId) -> Result<SkillGuard, LedgerError> {
        let lock = self
            .lock_for(skill_id)
            .try_lock_owned()
            .map_err(|_| LedgerError::Busy(skill_id.clone()))?;
        Ok(SkillGuard {
            skill_id: skill_id.clone(),
            _lock: lock,
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current record for a skill, if installed.
    pub async fn record(&self, skill_id: &SkillId) -> Result<Option<SkillRecord>, LedgerError> {
        let row: Option<SkillRow> = sqlx::query_as(
            "SELECT id, root, source_digest, state, clean_runs, epoch, version, updated_at \
             FROM skills WHERE id = ?1",
        )
        .bind(skill_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(skill_from_row).transpose()
    }

    /// Current record for a skill.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownSkill`] when the skill is not installed.
    pub async fn require(&self, skill_id: &SkillId) -> Result<SkillRecord, LedgerError> {
        self.record(skill_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownSkill(skill_id.clone()))
    }

    /// All installed skills ordered by id.
    pub async fn records(&self) -> Result<Vec<SkillRecord>, LedgerError> {
        let rows: Vec<SkillRow> = sqlx::query_as(
            "SELECT id, root, source_digest, state, clean_runs, epoch, version, updated_at \
             FROM skills ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(skill_from_row).collect()
    }

    /// Latest risk report for a skill.
    pub async fn latest_report(
        &self,
        skill_id: &SkillId,
    ) -> Result<Option<RiskReport>, LedgerError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT report_json FROM risk_reports WHERE skill_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(skill_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(json,)| serde_json::from_str(&json).map_err(LedgerError::from))
            .transpose()
    }

    /// Number of reports ever recorded for a skill.
    pub async fn report_count(&self, skill_id: &SkillId) -> Result<u64, LedgerError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM risk_reports WHERE skill_id = ?1")
            .bind(skill_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(row.0).unwrap_or(0))
    }

    /// Invocation log for a skill across all epochs, newest first.
    pub async fn history(
        &self,
        skill_id: &SkillId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<InvocationRow> = sqlx::query_as(
            "SELECT id, skill_id, epoch, timestamp, outcome, flagged, duration_ms, command, \
                    executor, detail \
             FROM invocations WHERE skill_id = ?1 \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
        )
        .bind(skill_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(history_from_row).collect()
    }

    /// State changes for a skill, oldest first.
    pub async fn transitions(
        &self,
        skill_id: &SkillId,
    ) -> Result<Vec<TransitionRecord>, LedgerError> {
        let rows: Vec<(i64, String, String, String, String, String)> = sqlx::query_as(
            "SELECT epoch, from_state, to_state, actor, reason, created_at \
             FROM transitions WHERE skill_id = ?1 ORDER BY id ASC",
        )
        .bind(skill_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(epoch, from, to, actor, reason, created_at)| {
                Ok(TransitionRecord {
                    skill_id: skill_id.clone(),
                    epoch,
                    from: TrustState::parse(&from)?,
                    to: TrustState::parse(&to)?,
                    actor,
                    reason,
                    created_at,
                })
            })
            .collect()
    }

    /// Promotion audit trail for a skill.
    pub async fn promotions(
        &self,
        skill_id: &SkillId,
    ) -> Result<Vec<PromotionRecord>, LedgerError> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT source_digest, approver, approval_id, promoted_at \
             FROM promotions WHERE skill_id = ?1 ORDER BY id ASC",
        )
        .bind(skill_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(source_digest, approver, approval_id, promoted_at)| PromotionRecord {
                    skill_id: skill_id.clone(),
                    source_digest,
                    approver,
                    approval_id,
                    promoted_at,
                },
            )
            .collect())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Install a skill, or reset it when its source changed.
    ///
    /// A new skill starts `Unaudited`. An installed skill whose digest differs
    /// is reset to `Unaudited` in a new epoch. An unchanged skill is returned
    /// as is.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::TrustStateConflict`] if another writer changed
    /// the row concurrently.
    pub async fn register(
        &self,
        guard: &SkillGuard,
        skill: &Skill,
        actor: &str,
    ) -> Result<SkillRecord, LedgerError> {
        check_guard(guard, &skill.id)?;
        match self.record(&skill.id).await? {
            Some(record) if record.source_digest == skill.source_digest => Ok(record),
            Some(_) => self.reset(guard, skill, actor, "source changed").await,
            None => {
                let now = Utc::now().to_rfc3339();
                sqlx::query(
                    "INSERT INTO skills (id, root, source_digest, state, clean_runs, epoch, \
                                         version, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, 'unaudited', 0, 1, 0, ?4, ?4)",
                )
                .bind(skill.id.as_str())
                .bind(skill.root.display().to_string())
                .bind(&skill.source_digest)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                info!(skill = %skill.id, actor, "skill installed");
                self.require(&skill.id).await
            }
        }
    }

    /// Reset a skill to `Unaudited` in a new epoch ahead of a re-audit.
    ///
    /// Prior invocations stay in the log under their old epoch.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownSkill`] or
    /// [`LedgerError::TrustStateConflict`].
    pub async fn reset(
        &self,
        guard: &SkillGuard,
        skill: &Skill,
        actor: &str,
        reason: &str,
    ) -> Result<SkillRecord, LedgerError> {
        check_guard(guard, &skill.id)?;
        let record = self.require(&skill.id).await?;
        let now = Utc::now().to_rfc3339();
        let epoch = record.epoch.saturating_add(1);

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE skills SET state = 'unaudited', clean_runs = 0, epoch = ?1, \
                               source_digest = ?2, root = ?3, version = version + 1, \
                               updated_at = ?4 \
             WHERE id = ?5 AND version = ?6",
        )
        .bind(epoch)
        .bind(&skill.source_digest)
        .bind(skill.root.display().to_string())
        .bind(&now)
        .bind(skill.id.as_str())
        .bind(record.version)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::TrustStateConflict(skill.id.clone()));
        }
        insert_transition(
            &mut tx,
            &skill.id,
            epoch,
            record.state,
            TrustState::Unaudited,
            actor,
            &format!("re-audit: {reason}"),
        )
        .await?;
        tx.commit().await?;

        info!(skill = %skill.id, from = %record.state, epoch, reason, "trust state reset");
        self.require(&skill.id).await
    }

    /// Attach a risk report and apply the audit transition.
    ///
    /// A skill that was quarantined before the reset stays quarantined.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the skill is
    /// `Unaudited`, or a conflict/database error.
    pub async fn record_audit(
        &self,
        guard: &SkillGuard,
        report: &RiskReport,
        actor: &str,
    ) -> Result<SkillRecord, LedgerError> {
        check_guard(guard, &report.skill_id)?;
        let record = self.require(&report.skill_id).await?;
        let hold = self.quarantine_carried(&record).await?;
        let step = record.status().apply_audit(report.has_high(), hold)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO risk_reports (skill_id, epoch, source_digest, severity, label, \
                                       findings, report_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(report.skill_id.as_str())
        .bind(record.epoch)
        .bind(&report.source_digest)
        .bind(report.severity().map(|s| s.to_string()))
        .bind(report.label().as_str())
        .bind(i64::try_from(report.findings.len()).unwrap_or(i64::MAX))
        .bind(serde_json::to_string(report)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        let updated = apply_step(&mut tx, &record, &step, actor).await?;
        tx.commit().await?;

        if updated.state == TrustState::Quarantined {
            warn!(skill = %updated.id, reason = %step.reason, "skill quarantined by audit");
        }
        Ok(updated)
    }

    /// Append an invocation and apply its effect on the counter and state.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] when the skill is not in an
    /// executable state, or a conflict/database error.
    pub async fn record_invocation(
        &self,
        guard: &SkillGuard,
        invocation: &Invocation,
    ) -> Result<SkillRecord, LedgerError> {
        check_guard(guard, &invocation.skill_id)?;
        let record = self.require(&invocation.skill_id).await?;
        let step = record.status().apply_invocation(
            invocation.outcome,
            invocation.flagged,
            self.threshold,
        )?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO invocations (id, skill_id, epoch, timestamp, outcome, flagged, \
                                      duration_ms, command, executor, detail) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&invocation.id)
        .bind(invocation.skill_id.as_str())
        .bind(record.epoch)
        .bind(invocation.timestamp.to_rfc3339())
        .bind(invocation.outcome.as_str())
        .bind(i64::from(invocation.flagged))
        .bind(i64::try_from(invocation.duration_ms).unwrap_or(i64::MAX))
        .bind(&invocation.command)
        .bind(invocation.executor.as_str())
        .bind(&invocation.detail)
        .execute(&mut *tx)
        .await?;
        let updated = apply_step(&mut tx, &record, &step, "executor").await?;
        tx.commit().await?;

        match (record.state, updated.state) {
            (from, TrustState::Quarantined) => warn!(
                skill = %updated.id,
                from = %from,
                detail = invocation.detail.as_deref().unwrap_or(""),
                "skill quarantined after flagged invocation"
            ),
            (TrustState::Sandboxed, TrustState::PendingPromotion) => info!(
                skill = %updated.id,
                clean_runs = updated.clean_runs,
                "skill eligible for promotion"
            ),
            _ => {}
        }
        Ok(updated)
    }

    /// Promote a `PendingPromotion` skill after an approved promotion request.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the skill is
    /// `PendingPromotion`, or a conflict/database error.
    pub async fn approve_promotion(
        &self,
        guard: &SkillGuard,
        approver: &str,
        approval_id: &str,
    ) -> Result<SkillRecord, LedgerError> {
        let record = self.require(guard.skill_id()).await?;
        let step = record.status().apply_promotion()?;

        let mut tx = self.pool.begin().await?;
        let updated = apply_step(&mut tx, &record, &step, approver).await?;
        sqlx::query(
            "INSERT INTO promotions (skill_id, epoch, source_digest, approver, approval_id, \
                                     promoted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(record.id.as_str())
        .bind(record.epoch)
        .bind(&record.source_digest)
        .bind(approver)
        .bind(approval_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(skill = %record.id, approver, approval_id, "skill promoted to trusted");
        Ok(updated)
    }

    /// Release a quarantined skill back to the sandbox after human review.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the skill is
    /// `Quarantined`, or a conflict/database error.
    pub async fn manual_review(
        &self,
        guard: &SkillGuard,
        reviewer: &str,
        note: &str,
    ) -> Result<SkillRecord, LedgerError> {
        let record = self.require(guard.skill_id()).await?;
        let mut step = record.status().apply_review()?;
        if !note.trim().is_empty() {
            step.reason = format!("{}: {}", step.reason, note.trim());
        }

        let updated = self.commit_step(guard, &record, &step, reviewer).await?;

        info!(skill = %record.id, reviewer, "quarantine released by manual review");
        Ok(updated)
    }

    /// Write a step computed from `expected`.
    ///
    /// The write lands only while the row still carries `expected.version`.
    /// A row that moved on since it was read yields
    /// [`LedgerError::TrustStateConflict`] and stays as it is.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::GuardMismatch`], the conflict above, or a
    /// database error.
    pub async fn commit_step(
        &self,
        guard: &SkillGuard,
        expected: &SkillRecord,
        step: &Step,
        actor: &str,
    ) -> Result<SkillRecord, LedgerError> {
        check_guard(guard, &expected.id)?;
        let mut tx = self.pool.begin().await?;
        let updated = apply_step(&mut tx, expected, step, actor).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Persist an approval request. Terminal decisions are never overwritten.
    ///
    /// # Errors
    ///
    /// Returns a database error if the write fails.
    pub async fn record_approval(&self, request: &ApprovalRequest) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO approvals (id, skill_id, kind, action, risk_level, created_at, \
                                    expires_at, decision, approver, decided_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(id) DO UPDATE SET \
                decision = excluded.decision, \
                approver = excluded.approver, \
                decided_at = excluded.decided_at \
             WHERE approvals.decision = 'pending'",
        )
        .bind(&request.id)
        .bind(request.skill_id.as_str())
        .bind(request.kind.as_str())
        .bind(&request.action_description)
        .bind(request.risk_level.as_str())
        .bind(request.created_at.to_rfc3339())
        .bind(request.expires_at.to_rfc3339())
        .bind(request.decision.as_str())
        .bind(&request.approver)
        .bind(request.decided_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a session lease, replacing the previous grant for its scope.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] when the write fails.
    pub async fn record_lease(&self, lease: &SessionLease) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO leases (user_id, project_scope, granted_at, expires_at, max_risk, \
                                 approval_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(user_id, project_scope) DO UPDATE SET \
                granted_at = excluded.granted_at, \
                expires_at = excluded.expires_at, \
                max_risk = excluded.max_risk, \
                approval_id = excluded.approval_id",
        )
        .bind(&lease.user_id)
        .bind(&lease.project_scope)
        .bind(lease.granted_at.to_rfc3339())
        .bind(lease.expires_at.to_rfc3339())
        .bind(lease.max_risk.as_str())
        .bind(&lease.approval_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persisted leases still active at `at`, soonest expiry first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] when the read fails and
    /// [`LedgerError::InvalidEnum`] for rows that do not parse.
    pub async fn active_leases(&self, at: DateTime<Utc>) -> Result<Vec<SessionLease>, LedgerError> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            "SELECT user_id, project_scope, granted_at, expires_at, max_risk, approval_id \
             FROM leases",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut leases = rows
            .into_iter()
            .map(lease_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        leases.retain(|lease| lease.is_active(at));
        leases.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(leases)
    }

    /// Whether the reset that opened the current epoch came from quarantine.
    async fn quarantine_carried(&self, record: &SkillRecord) -> Result<bool, LedgerError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT from_state FROM transitions \
             WHERE skill_id = ?1 AND epoch = ?2 AND to_state = 'unaudited' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(record.id.as_str())
        .bind(record.epoch)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|(from,)| from == TrustState::Quarantined.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn check_guard(guard: &SkillGuard, target: &SkillId) -> Result<(), LedgerError> {
    if guard.skill_id() == target {
        Ok(())
    } else {
        Err(LedgerError::GuardMismatch {
            guard: guard.skill_id().clone(),
            target: target.clone(),
        })
    }
}

/// Write a step with the optimistic version check and log the transition.
async fn apply_step(
    tx: &mut Transaction<'_, Sqlite>,
    record: &SkillRecord,
    step: &Step,
    actor: &str,
) -> Result<SkillRecord, LedgerError> {
    let now = Utc::now().to_rfc3339();
    let TrustStatus { state, clean_runs } = step.status;
    let updated = sqlx::query(
        "UPDATE skills SET state = ?1, clean_runs = ?2, version = version + 1, updated_at = ?3 \
         WHERE id = ?4 AND version = ?5",
    )
    .bind(state.as_str())
    .bind(i64::from(clean_runs))
    .bind(&now)
    .bind(record.id.as_str())
    .bind(record.version)
    .execute(&mut **tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(LedgerError::TrustStateConflict(record.id.clone()));
    }

    if state != record.state {
        insert_transition(
            tx,
            &record.id,
            record.epoch,
            record.state,
            state,
            actor,
            &step.reason,
        )
        .await?;
    }

    Ok(SkillRecord {
        state,
        clean_runs,
        version: record.version.saturating_add(1),
        updated_at: now,
        ..record.clone()
    })
}

async fn insert_transition(
    tx: &mut Transaction<'_, Sqlite>,
    skill_id: &SkillId,
    epoch: i64,
    from: TrustState,
    to: TrustState,
    actor: &str,
    reason: &str,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO transitions (skill_id, epoch, from_state, to_state, actor, reason, \
                                  created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(skill_id.as_str())
    .bind(epoch)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(actor)
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_skill_id(raw: &str) -> Result<SkillId, LedgerError> {
    SkillId::parse(raw).map_err(|_| LedgerError::InvalidEnum {
        field: "skill_id",
        value: raw.to_owned(),
    })
}

fn skill_from_row(row: SkillRow) -> Result<SkillRecord, LedgerError> {
    let (id, root, source_digest, state, clean_runs, epoch, version, updated_at) = row;
    Ok(SkillRecord {
        id: parse_skill_id(&id)?,
        root,
        source_digest,
        state: TrustState::parse(&state)?,
        clean_runs: u32::try_from(clean_runs.max(0)).unwrap_or(u32::MAX),
        epoch,
        version,
        updated_at,
    })
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| LedgerError::InvalidEnum {
            field,
            value: raw.to_owned(),
        })
}

fn lease_from_row(row: LeaseRow) -> Result<SessionLease, LedgerError> {
    let (user_id, project_scope, granted_at, expires_at, max_risk, approval_id) = row;
    Ok(SessionLease {
        user_id,
        project_scope,
        granted_at: parse_timestamp("granted_at", &granted_at)?,
        expires_at: parse_timestamp("expires_at", &expires_at)?,
        max_risk: max_risk
            .parse::<RiskLevel>()
            .map_err(|_| LedgerError::InvalidEnum {
                field: "max_risk",
                value: max_risk.clone(),
            })?,
        approval_id,
    })
}

fn history_from_row(row: InvocationRow) -> Result<HistoryEntry, LedgerError> {
    let (id, skill_id, epoch, timestamp, outcome, flagged, duration_ms, command, executor, detail) =
        row;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|_| LedgerError::InvalidEnum {
            field: "timestamp",
            value: timestamp.clone(),
        })?
        .with_timezone(&Utc);
    let executor = match executor.as_str() {
        "sandbox" => ExecutorKind::Sandbox,
        "host" => ExecutorKind::Host,
        other => {
            return Err(LedgerError::InvalidEnum {
                field: "executor",
                value: other.to_owned(),
            })
        }
    };
    Ok(HistoryEntry {
        epoch,
        invocation: Invocation {
            id,
            skill_id: parse_skill_id(&skill_id)?,
            timestamp,
            outcome: Outcome::parse(&outcome)?,
            flagged: flagged != 0,
            duration_ms: u64::try_from(duration_ms).unwrap_or(0),
            command,
            executor,
            detail,
        },
    })
}
