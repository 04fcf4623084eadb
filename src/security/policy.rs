//! Security policy and the decision matrix.
//!
//! The evaluator turns (policy, analysis, allowlist evaluation, approval
//! state) into exactly one of allow / ask / deny. Precedence is fixed:
//! hard deny, platform permission, the Windows cmd.exe rule, approval
//! requirement, allowlist miss, allow. Deny-by-default: every gate must
//! pass before the command reaches the executor.

use crate::command::ApprovalDecision;
use crate::config::Config;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Security mode for command execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// No allowlist checks; analysis failures may still prompt.
    Off,
    /// Only allowlisted programs run without approval.
    #[default]
    Allowlist,
    /// Nothing runs.
    Deny,
}

/// When the operator is asked before execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AskMode {
    Never,
    /// Ask when the command is not fully trusted by analysis + allowlist.
    #[default]
    Untrusted,
    Always,
}

/// Per-agent resolved policy.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub security: SecurityMode,
    pub ask: AskMode,
    pub safe_bins: Vec<PathBuf>,
    pub skill_bins: HashSet<String>,
    pub auto_allow_skills: bool,
}

impl Policy {
    /// Resolve the effective policy for an agent: agent overrides win
    /// field-by-field over the global `[security]` table.
    pub fn resolve(config: &Config, agent_id: Option<&str>) -> Self {
        let global = &config.security;
        let overrides = agent_id.and_then(|id| config.agents.get(id));

        let pick_security = overrides
            .and_then(|o| o.security)
            .unwrap_or(global.security);
        let pick_ask = overrides.and_then(|o| o.ask).unwrap_or(global.ask);
        let safe_bins = overrides
            .and_then(|o| o.safe_bins.clone())
            .unwrap_or_else(|| global.safe_bins.clone());
        let skill_bins = overrides
            .and_then(|o| o.skill_bins.clone())
            .unwrap_or_else(|| global.skill_bins.clone());
        let auto_allow_skills = overrides
            .and_then(|o| o.auto_allow_skills)
            .unwrap_or(global.auto_allow_skills);

        Self {
            security: pick_security,
            ask: pick_ask,
            safe_bins,
            skill_bins: skill_bins.into_iter().collect(),
            auto_allow_skills,
        }
    }
}

/// Approval state accompanying a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalInput {
    pub approved: bool,
    pub decision: Option<ApprovalDecision>,
}

/// Why execution was denied. The string forms appear verbatim in
/// `exec.denied` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    SecurityDeny,
    AllowlistMiss,
    ApprovalRequired,
    ScreenRecordingPermission,
    CompanionUnavailable,
    Cancelled,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SecurityDeny => "security=deny",
            Self::AllowlistMiss => "allowlist-miss",
            Self::ApprovalRequired => "approval-required",
            Self::ScreenRecordingPermission => "permission:screenRecording",
            Self::CompanionUnavailable => "companion-unavailable",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of policy evaluation for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Ask,
    Deny(DenyReason),
}

/// Host facts the decision depends on, injectable so the Windows-only
/// branches are testable on any platform.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub windows: bool,
    pub screen_recording_granted: bool,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self {
            windows: cfg!(windows),
            screen_recording_granted: false,
        }
    }
}

/// Everything `final_decision` looks at besides the policy itself.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput {
    pub analysis_ok: bool,
    pub allowlist_satisfied: bool,
    pub approval: ApprovalInput,
    pub needs_screen_recording: bool,
    /// The outer argv invokes cmd.exe (directly or as wrapper).
    pub outer_is_cmd_exe: bool,
}

/// Does this request need an operator decision before it may run?
pub fn requires_approval(
    ask: AskMode,
    security: SecurityMode,
    analysis_ok: bool,
    allowlist_satisfied: bool,
) -> bool {
    match ask {
        AskMode::Always => true,
        AskMode::Never => false,
        AskMode::Untrusted => {
            (security == SecurityMode::Allowlist && (!analysis_ok || !allowlist_satisfied))
                || (security == SecurityMode::Off && !analysis_ok)
        }
    }
}

/// The decision matrix.
pub fn final_decision(policy: &Policy, input: &DecisionInput, ctx: &EvalContext) -> Decision {
    if policy.security == SecurityMode::Deny {
        return Decision::Deny(DenyReason::SecurityDeny);
    }

    if input.needs_screen_recording && !ctx.screen_recording_granted {
        return Decision::Deny(DenyReason::ScreenRecordingPermission);
    }

    // cmd.exe can smuggle arbitrary continuations through its command line;
    // on Windows under allowlist security an unapproved cmd.exe invocation
    // is treated as unanalyzable, which forces the ask path below.
    let analysis_ok = if ctx.windows
        && policy.security == SecurityMode::Allowlist
        && input.outer_is_cmd_exe
        && !input.approval.approved
    {
        false
    } else {
        input.analysis_ok
    };

    if requires_approval(
        policy.ask,
        policy.security,
        analysis_ok,
        input.allowlist_satisfied,
    ) && !input.approval.approved
    {
        return Decision::Ask;
    }

    if policy.security == SecurityMode::Allowlist
        && !input.allowlist_satisfied
        && !input.approval.approved
    {
        return Decision::Deny(DenyReason::AllowlistMiss);
    }

    Decision::Allow
}
