//! The run orchestrator.
//!
//! Sequences normalization → policy resolution → analysis → allowlist
//! evaluation → decision → dispatch, emitting exactly one completion event
//! per accepted request. Failures never cross the boundary as panics or
//! `Err`: every outcome is an `INVALID_REQUEST` or `UNAVAILABLE` reply.

pub mod events;

use crate::approval::{ApprovalManager, RequestSummary};
use crate::command::resolve::{resolve, ResolverContext};
use crate::command::shell::{outer_is_cmd_exe, parse_shell, AnalyzedCommand};
use crate::command::{normalize, ApprovalDecision, ExecRequest, NormalizedCommand};
use crate::config::Config;
use crate::runtime::{ExecSpec, Executor};
use crate::security::{
    final_decision, AllowlistEvaluation, AllowlistStore, ApprovalInput, Decision, DecisionInput,
    DenyReason, EvalContext, Policy, SecurityMode,
};
use events::{truncate_streams, EventSink, ExecEvent};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reply codes on the wire.
pub const CODE_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const CODE_UNAVAILABLE: &str = "UNAVAILABLE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// Outbound reply for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(rename = "payloadJSON", skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    fn success(payload_json: String) -> Self {
        Self {
            ok: true,
            payload_json: Some(payload_json),
            error: None,
        }
    }

    fn invalid_request(message: impl Into<String>, detail_code: Option<&str>) -> Self {
        Self {
            ok: false,
            payload_json: None,
            error: Some(ReplyError {
                code: CODE_INVALID_REQUEST.to_string(),
                message: message.into(),
                details: detail_code.map(|code| ErrorDetails {
                    code: code.to_string(),
                }),
            }),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload_json: None,
            error: Some(ReplyError {
                code: CODE_UNAVAILABLE.to_string(),
                message: message.into(),
                details: None,
            }),
        }
    }
}

/// The command execution gatekeeper.
///
/// Owns no durable state of its own — the allowlist and approval stores are
/// injected services; per-request state lives and dies inside [`handle`].
///
/// [`handle`]: Gatekeeper::handle
pub struct Gatekeeper {
    config: Arc<Config>,
    allowlist: Arc<AllowlistStore>,
    approvals: Arc<ApprovalManager>,
    executor: Arc<dyn Executor>,
    events: Arc<dyn EventSink>,
    eval_ctx: EvalContext,
}

impl Gatekeeper {
    pub fn new(
        config: Arc<Config>,
        allowlist: Arc<AllowlistStore>,
        approvals: Arc<ApprovalManager>,
        executor: Arc<dyn Executor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            allowlist,
            approvals,
            executor,
            events,
            eval_ctx: EvalContext::default(),
        }
    }

    /// Override host facts (platform, granted permissions). Tests use this
    /// to exercise the Windows-only branches anywhere.
    pub fn with_eval_context(mut self, eval_ctx: EvalContext) -> Self {
        self.eval_ctx = eval_ctx;
        self
    }

    /// The approval store, for hosts that surface prompts and resolve them.
    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    pub fn allowlist(&self) -> &Arc<AllowlistStore> {
        &self.allowlist
    }

    pub async fn handle(&self, request: ExecRequest) -> Reply {
        self.handle_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn handle_with_cancel(
        &self,
        request: ExecRequest,
        cancel: CancellationToken,
    ) -> Reply {
        // 1. Normalize. Request-shape failures reply directly; no event.
        let normalized = match normalize(&request.command, request.raw_command.as_deref()) {
            Ok(normalized) => normalized,
            Err(e) => {
                debug!("rejecting request: {e}");
                return Reply::invalid_request(e.to_string(), Some(e.code()));
            }
        };

        // A claimed pre-approval that names a run must bind to the recorded
        // approval; a mismatch is a request-shape error, not a denial.
        let request = if request.claims_approval() && request.run_id.is_some() {
            match self
                .approvals
                .sanitize_for_forwarding(&request, crate::util::now_ms())
            {
                Ok(forwarded) => forwarded,
                Err(rejection) => {
                    debug!("rejecting approval binding: {}", rejection.message);
                    return Reply::invalid_request(rejection.message, rejection.detail_code);
                }
            }
        } else {
            request
        };

        // 2. Per-agent policy.
        let policy = Policy::resolve(&self.config, request.agent_id.as_deref());

        // 3. Analyze, shell or argv branch, then resolve each segment.
        let cwd = request
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let env = request.env.clone().unwrap_or_default();

        let mut analysis = match &normalized.shell_command {
            Some(shell_command) => parse_shell(shell_command),
            None => AnalyzedCommand::from_argv(&normalized.argv),
        };
        let resolver_ctx = ResolverContext {
            cwd: &cwd,
            env: &env,
            safe_bins: &policy.safe_bins,
            skill_bins: &policy.skill_bins,
            auto_allow_skills: policy.auto_allow_skills,
        };
        for segment in &mut analysis.segments {
            if let Some(program) = segment.argv.first() {
                segment.resolution = Some(resolve(program, &resolver_ctx));
            }
        }

        // 4. Allowlist evaluation.
        let evaluation = self
            .allowlist
            .evaluate(&analysis, request.agent_id.as_deref());

        // 5. Decision.
        let approval = ApprovalInput {
            approved: request.claims_approval(),
            decision: request.approval_decision,
        };
        let input = DecisionInput {
            analysis_ok: analysis.ok,
            allowlist_satisfied: evaluation.satisfied,
            approval,
            needs_screen_recording: request.needs_screen_recording.unwrap_or(false),
            outer_is_cmd_exe: outer_is_cmd_exe(&normalized.argv),
        };
        let decision = final_decision(&policy, &input, &self.eval_ctx);
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        debug!(
            %run_id,
            cmd_text = %normalized.cmd_text,
            ?decision,
            analysis_ok = analysis.ok,
            allowlist_satisfied = evaluation.satisfied,
            "evaluated exec request"
        );

        match decision {
            Decision::Deny(reason) => {
                self.emit_denied(&request, &normalized, &run_id, reason).await;
                Reply::unavailable(format!("execution denied: {reason}"))
            }
            Decision::Ask => {
                let summary = RequestSummary {
                    host: self.executor.name().to_string(),
                    command: normalized.cmd_text.clone(),
                    cwd: request.cwd.clone(),
                    agent_id: request.agent_id.clone(),
                    session_key: request.session_key.clone(),
                };
                let requester = request.agent_id.as_deref().unwrap_or("agent");
                self.approvals.open(summary, requester, Some(&run_id));
                self.emit_denied(&request, &normalized, &run_id, DenyReason::ApprovalRequired)
                    .await;
                Reply::unavailable("approval required")
            }
            Decision::Allow => {
                self.run_allowed(
                    &request, &normalized, &analysis, &evaluation, &policy, approval, &run_id,
                    cancel,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_allowed(
        &self,
        request: &ExecRequest,
        normalized: &NormalizedCommand,
        analysis: &AnalyzedCommand,
        evaluation: &AllowlistEvaluation,
        policy: &Policy,
        approval: ApprovalInput,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Reply {
        // Allow-always inserts the resolved programs so the next run skips
        // the prompt; every matched entry records this use.
        if approval.decision == Some(ApprovalDecision::AllowAlways)
            && policy.security == SecurityMode::Allowlist
            && analysis.ok
        {
            for segment in &analysis.segments {
                let Some(resolution) = &segment.resolution else {
                    continue;
                };
                if !resolution.is_resolved() {
                    continue;
                }
                if let Err(e) = self
                    .allowlist
                    .add_entry(request.agent_id.as_deref(), &resolution.resolved_path)
                {
                    warn!("failed to allowlist {}: {e:#}", resolution.resolved_path.display());
                }
            }
        }
        for matched in &evaluation.matches {
            self.allowlist.record_use(
                matched.entry.agent_id.as_deref(),
                &matched.entry.pattern,
                &normalized.cmd_text,
            );
        }

        // Unwrap the shell on Windows when the analysis fully vouched for a
        // single segment: executing the segment argv directly removes the
        // cmd.exe attack surface.
        let exec_argv = if self.eval_ctx.windows
            && policy.security == SecurityMode::Allowlist
            && !approval.approved
            && normalized.shell_command.is_some()
            && analysis.ok
            && evaluation.satisfied
            && analysis.segments.len() == 1
        {
            analysis.segments[0].argv.clone()
        } else {
            normalized.argv.clone()
        };

        let max_timeout = self.config.exec.max_timeout_ms;
        let timeout_ms = request.timeout_ms.unwrap_or(max_timeout).min(max_timeout);
        let spec = ExecSpec {
            argv: exec_argv,
            cwd: request.cwd.as_ref().map(PathBuf::from),
            env: request.env.clone().unwrap_or_default(),
            timeout: Duration::from_millis(timeout_ms),
        };

        // The request timeout is advisory to the executor; the orchestrator
        // enforces the bound itself and treats exceedance as a timeout
        // result. Small slack lets a well-behaved executor report first.
        let enforced = Duration::from_millis(timeout_ms) + Duration::from_secs(1);
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                self.emit_denied(request, normalized, run_id, DenyReason::Cancelled).await;
                return Reply::unavailable("execution cancelled");
            }
            outcome = tokio::time::timeout(enforced, self.executor.execute(spec)) => outcome,
        };

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("executor unreachable: {e:#}");
                self.emit_denied(request, normalized, run_id, DenyReason::CompanionUnavailable)
                    .await;
                return Reply::unavailable(format!("executor unreachable: {e}"));
            }
            Err(_) => crate::runtime::RunResult {
                exit_code: None,
                timed_out: true,
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!(
                    "executor exceeded the {timeout_ms}ms bound and was abandoned"
                )),
            },
        };

        let (stdout, stderr) = truncate_streams(
            std::mem::take(&mut result.stdout),
            std::mem::take(&mut result.stderr),
            self.config.exec.max_output_bytes,
        );
        result.stdout = stdout;
        result.stderr = stderr;

        self.events
            .emit(ExecEvent::Finished {
                session_key: request.session_key.clone(),
                run_id: run_id.to_string(),
                cmd_text: normalized.cmd_text.clone(),
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                success: result.success,
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                error: result.error.clone(),
            })
            .await;

        match serde_json::to_string(&result) {
            Ok(payload) => Reply::success(payload),
            Err(e) => {
                warn!("failed to serialize run result: {e}");
                Reply::unavailable("failed to serialize execution result")
            }
        }
    }

    async fn emit_denied(
        &self,
        request: &ExecRequest,
        normalized: &NormalizedCommand,
        run_id: &str,
        reason: DenyReason,
    ) {
        self.events
            .emit(ExecEvent::Denied {
                session_key: request.session_key.clone(),
                run_id: run_id.to_string(),
                host: self.executor.name().to_string(),
                command: normalized.cmd_text.clone(),
                reason: reason.as_str().to_string(),
            })
            .await;
    }
}
