//! Operator approvals bound to specific invocations.
//!
//! A record is opened when a command needs an operator decision and is keyed
//! by the invocation's run id. Decisions are monotonic: once resolved a
//! record never reverts, and an expired record never resolves.
//! `sanitize_for_forwarding` is the bridge back from an approved record to a
//! later invocation — it is what makes "approve `echo hi`, execute
//! `echo hi && rm -rf /`" impossible.

use crate::command::{normalize, ApprovalDecision, ExecRequest};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Scope an identity must hold for its decisions to bind executions.
pub const APPROVE_SCOPE: &str = "exec.approve";

/// An identity that opens or resolves approvals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub id: String,
    pub scopes: Vec<String>,
}

impl Requester {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scopes: Vec::new(),
        }
    }

    pub fn with_scopes(id: impl Into<String>, scopes: &[&str]) -> Self {
        Self {
            id: id.into(),
            scopes: scopes.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn can_approve(&self) -> bool {
        self.scopes.iter().any(|s| s == APPROVE_SCOPE)
    }
}

/// Decision state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordDecision {
    Pending,
    AllowOnce,
    AllowAlways,
    Deny,
}

impl RecordDecision {
    pub fn is_resolved(self) -> bool {
        self != Self::Pending
    }

    pub fn is_approved(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }

    pub fn as_approval_decision(self) -> Option<ApprovalDecision> {
        match self {
            Self::AllowOnce => Some(ApprovalDecision::AllowOnce),
            Self::AllowAlways => Some(ApprovalDecision::AllowAlways),
            Self::Pending | Self::Deny => None,
        }
    }
}

/// What the operator sees when deciding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub host: String,
    /// Normalized command text; equality against a later request is checked
    /// on this field.
    pub command: String,
    pub cwd: Option<String>,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
}

/// One approval, keyed by run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: String,
    pub summary: RequestSummary,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub requester: String,
    pub decision: RecordDecision,
    pub resolved_at_ms: Option<i64>,
    pub resolved_by: Option<Requester>,
}

impl ApprovalRecord {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at_ms
    }
}

/// Why a forwarded approval was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizeRejection {
    pub message: String,
    /// Detail code for request-shape failures (`RAW_COMMAND_MISMATCH`,
    /// `MISSING_COMMAND`); `None` for binding failures.
    pub detail_code: Option<&'static str>,
}

impl SanitizeRejection {
    fn binding(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail_code: None,
        }
    }
}

/// Tracks outstanding and resolved approvals.
pub struct ApprovalManager {
    ttl_ms: i64,
    records: Mutex<HashMap<String, ApprovalRecord>>,
    notify: Notify,
}

impl ApprovalManager {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            records: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Open a record for a pending decision, or reuse the existing record
    /// when the run id already has one. Returns the record id (the run id).
    pub fn open(
        &self,
        summary: RequestSummary,
        requester: &str,
        run_id: Option<&str>,
    ) -> String {
        let now = crate::util::now_ms();
        let id = run_id
            .map(ToString::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut records = self.records.lock();
        purge_expired(&mut records, now);
        records.entry(id.clone()).or_insert_with(|| ApprovalRecord {
            id: id.clone(),
            summary,
            created_at_ms: now,
            expires_at_ms: now + self.ttl_ms,
            requester: requester.to_string(),
            decision: RecordDecision::Pending,
            resolved_at_ms: None,
            resolved_by: None,
        });
        id
    }

    /// Record the operator's decision. Fails if the record is unknown,
    /// expired, or already resolved — transitions are monotonic.
    pub fn resolve(&self, id: &str, decision: RecordDecision, resolver: &Requester) -> Result<()> {
        if decision == RecordDecision::Pending {
            bail!("cannot resolve an approval to pending");
        }

        let now = crate::util::now_ms();
        {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(id) else {
                bail!("no approval record for run {id}");
            };
            if record.decision.is_resolved() {
                bail!("approval {id} is already resolved");
            }
            if record.is_expired(now) {
                bail!("approval {id} has expired");
            }
            record.decision = decision;
            record.resolved_at_ms = Some(now);
            record.resolved_by = Some(resolver.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Current state of a record, `None` when unknown or lazily destroyed.
    pub fn snapshot(&self, id: &str) -> Option<ApprovalRecord> {
        let now = crate::util::now_ms();
        let mut records = self.records.lock();
        purge_expired(&mut records, now);
        records.get(id).cloned()
    }

    /// Block until the record resolves, expires, or the caller cancels.
    /// Returns the final decision, or `None` on expiry/cancellation.
    pub async fn wait(&self, id: &str, cancel: &CancellationToken) -> Option<RecordDecision> {
        loop {
            let notified = self.notify.notified();

            match self.snapshot(id) {
                None => return None,
                Some(record) if record.decision.is_resolved() => return Some(record.decision),
                Some(record) => {
                    let now = crate::util::now_ms();
                    let remaining = record.expires_at_ms.saturating_sub(now).max(0) as u64;
                    tokio::select! {
                        () = notified => {}
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep(std::time::Duration::from_millis(remaining + 1)) => {}
                    }
                }
            }
        }
    }

    /// Verify that a request carrying a prior approval really is the
    /// invocation the operator approved, and stamp it accordingly.
    ///
    /// Three checks, all required: the request normalizes consistently, the
    /// referenced record was approved by a holder of [`APPROVE_SCOPE`], and
    /// the normalized command text equals the approved text. The returned
    /// params carry `approved = true` plus the recorded decision; the
    /// incoming claim is otherwise discarded.
    pub fn sanitize_for_forwarding(
        &self,
        params: &ExecRequest,
        now_ms: i64,
    ) -> Result<ExecRequest, SanitizeRejection> {
        let normalized =
            normalize(&params.command, params.raw_command.as_deref()).map_err(|e| {
                SanitizeRejection {
                    message: e.to_string(),
                    detail_code: Some(e.code()),
                }
            })?;

        let Some(run_id) = params.run_id.as_deref() else {
            return Err(SanitizeRejection::binding(
                "approved request carries no runId to bind against",
            ));
        };

        let Some(record) = self.snapshot(run_id) else {
            return Err(SanitizeRejection::binding(format!(
                "no approval record for run {run_id}"
            )));
        };

        if record.is_expired(now_ms) {
            return Err(SanitizeRejection::binding(format!(
                "approval for run {run_id} has expired"
            )));
        }

        if !record.decision.is_approved() {
            return Err(SanitizeRejection::binding(format!(
                "approval for run {run_id} is {}",
                match record.decision {
                    RecordDecision::Pending => "still pending",
                    RecordDecision::Deny => "denied",
                    _ => "not approved",
                }
            )));
        }

        match &record.resolved_by {
            Some(resolver) if resolver.can_approve() => {}
            _ => {
                return Err(SanitizeRejection::binding(format!(
                    "approval for run {run_id} was not resolved by a {APPROVE_SCOPE} holder"
                )));
            }
        }

        if record.summary.command != normalized.cmd_text {
            return Err(SanitizeRejection::binding(format!(
                "command text {:?} does not match the approved command {:?}",
                normalized.cmd_text, record.summary.command
            )));
        }

        let mut forwarded = params.clone();
        forwarded.approved = Some(true);
        forwarded.approval_decision = record.decision.as_approval_decision();
        Ok(forwarded)
    }
}

/// Lazy destruction: drop every record whose TTL window has passed.
fn purge_expired(records: &mut HashMap<String, ApprovalRecord>, now_ms: i64) {
    records.retain(|_, record| !record.is_expired(now_ms));
}
