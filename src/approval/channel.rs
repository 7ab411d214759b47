//! Delivery of approval prompts to a human and collection of responses.
//!
//! The gateway hands each prompt to an [`ApprovalChannel`]. Responses come
//! back asynchronously over an mpsc queue drained by [`pump`], which resolves
//! them against the gateway. The console channel uses the same short
//! callback format as chat buttons: `a:<id>` approves, `d:<id>` denies.

use std::io::BufRead;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ApprovalError, ApprovalGateway, ApprovalKind, Decision};
use crate::policy::RiskLevel;

/// Outbound message to the human channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPrompt {
    /// Request identifier.
    pub request_id: String,
    /// Skill asking.
    pub skill_name: String,
    /// What it wants to do.
    pub action_description: String,
    /// Classified risk.
    pub risk_level: RiskLevel,
    /// Deadline for a response.
    pub expires_at: DateTime<Utc>,
    /// Per-action or promotion.
    pub kind: ApprovalKind,
}

/// Inbound response from the human channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Request identifier.
    pub request_id: String,
    /// `Approved` or `Denied`.
    pub decision: Decision,
    /// Who answered.
    pub approver_identity: String,
}

/// External notification channel.
#[async_trait::async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Deliver a prompt. The response arrives later through the pump.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Channel`] when delivery fails; the request
    /// then expires.
    async fn send(&self, prompt: &ApprovalPrompt) -> Result<(), ApprovalError>;
}

/// Resolve every response arriving on `rx` until the sender side closes.
pub async fn pump(gateway: Arc<ApprovalGateway>, mut rx: mpsc::Receiver<ApprovalResponse>) {
    while let Some(response) = rx.recv().await {
        let id = response.request_id.clone();
        match gateway.resolve(response) {
            Ok(request) => debug!(id = %id, decision = %request.decision, "approval response applied"),
            Err(e) => warn!(id = %id, error = %e, "approval response rejected"),
        }
    }
}

/// Parse a callback line (`a:<id>` or `d:<id>`).
pub fn parse_callback(line: &str, approver: &str) -> Option<ApprovalResponse> {
    let (action, id) = line.trim().split_once(':')?;
    let decision = match action {
        "a" => Decision::Approved,
        "d" => Decision::Denied,
        _ => return None,
    };
    if id.is_empty() {
        return None;
    }
    Some(ApprovalResponse {
        request_id: id.to_owned(),
        decision,
        approver_identity: approver.to_owned(),
    })
}

/// Prompts on stderr, answers read from stdin.
#[derive(Debug, Clone)]
pub struct ConsoleChannel;

impl ConsoleChannel {
    /// Start a stdin reader thread that forwards callback lines to `tx`.
    ///
    /// The reader ends at EOF or when the receiving pump is gone. It runs on
    /// a detached OS thread so a pending read never holds up process exit.
    pub fn spawn_reader(
        approver: String,
        tx: mpsc::Sender<ApprovalResponse>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_callback(&line, &approver) {
                    Some(response) => {
                        if tx.blocking_send(response).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!("expected a:<id> or d:<id>"),
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl ApprovalChannel for ConsoleChannel {
    async fn send(&self, prompt: &ApprovalPrompt) -> Result<(), ApprovalError> {
        let heading = match prompt.kind {
            ApprovalKind::Action => "Approval required",
            ApprovalKind::Promotion => "Promotion to host execution requested",
        };
        eprintln!(
            "\n{heading} [{id}]\n  skill:   {skill}\n  action:  {action}\n  risk:    {risk}\n  expires: {expires}\nanswer a:{id} to approve or d:{id} to deny",
            id = prompt.request_id,
            skill = prompt.skill_name,
            action = prompt.action_description,
            risk = prompt.risk_level,
            expires = prompt.expires_at.format("%H:%M:%S UTC"),
        );
        Ok(())
    }
}
