//! Inbound command requests and their canonical form.
//!
//! Normalization is the first gate every request passes: it binds the
//! human-visible command text (`cmd_text`) to the argv that will execute,
//! and rejects any request where the two could tell different stories.

pub mod quote;
pub mod resolve;
pub mod shell;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Operator decision attached to a pre-approved request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    /// Execute this one invocation.
    AllowOnce,
    /// Execute and allowlist the resolved programs for next time.
    AllowAlways,
}

/// Inbound invocation request, exactly as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    /// Argv to execute; first element is the program.
    #[serde(default)]
    pub command: Vec<String>,
    /// The exact command string the operator will be shown, when the caller
    /// claims one. Must be consistent with `command` (see [`normalize`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_screen_recording: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_decision: Option<ApprovalDecision>,
}

impl ExecRequest {
    /// True when the caller claims the command was already approved, either
    /// via the `approved` flag or an explicit decision. The two are
    /// equivalent pre-approval signals; only `allow-always` has extra
    /// side effects downstream.
    pub fn claims_approval(&self) -> bool {
        self.approved == Some(true) || self.approval_decision.is_some()
    }
}

/// Canonical (argv, shell_command?, cmd_text) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCommand {
    /// Argv forwarded to the executor; never mutated after normalization.
    pub argv: Vec<String>,
    /// Reconstructed embedded command when argv is a shell-wrapper
    /// invocation, `None` otherwise.
    pub shell_command: Option<String>,
    /// Human-readable form for UI and audit events: the shell command when
    /// present, else the shell-quoted argv rendering.
    pub cmd_text: String,
}

/// Why a request failed normalization. These surface as `INVALID_REQUEST`
/// with the matching detail code and never produce an exec event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    MissingCommand,
    RawCommandMismatch {
        raw_command: String,
        rendered_argv: String,
        extracted_shell: Option<String>,
    },
}

impl NormalizeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCommand => "MISSING_COMMAND",
            Self::RawCommandMismatch { .. } => "RAW_COMMAND_MISMATCH",
        }
    }
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCommand => write!(f, "request is missing a command"),
            Self::RawCommandMismatch { raw_command, .. } => write!(
                f,
                "rawCommand {raw_command:?} does not match the command argv"
            ),
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Turn a (argv, rawCommand?) pair into the canonical triple.
///
/// When `raw_command` is present it must equal either the shell-quoted argv
/// rendering (direct form) or the command embedded in a recognized shell
/// wrapper. Anything else means the text shown to an operator would differ
/// from what executes, and the request is rejected.
pub fn normalize(
    argv: &[String],
    raw_command: Option<&str>,
) -> Result<NormalizedCommand, NormalizeError> {
    if argv.is_empty() || argv[0].trim().is_empty() {
        return Err(NormalizeError::MissingCommand);
    }

    let shell_command = shell::extract_shell_command_from_argv(argv);
    let rendered = quote::format_argv(argv);

    if let Some(raw) = raw_command {
        let matches_rendered = raw == rendered;
        let matches_extracted = shell_command.as_deref() == Some(raw);
        if !matches_rendered && !matches_extracted {
            return Err(NormalizeError::RawCommandMismatch {
                raw_command: raw.to_string(),
                rendered_argv: rendered,
                extracted_shell: shell_command,
            });
        }
    }

    let cmd_text = shell_command.clone().unwrap_or(rendered);

    Ok(NormalizedCommand {
        argv: argv.to_vec(),
        shell_command,
        cmd_text,
    })
}
