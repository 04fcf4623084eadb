//! Executor capability the gatekeeper dispatches to.
//!
//! The gatekeeper decides; the executor runs. Keeping the seam a trait
//! object lets hosts swap the native subprocess executor for a remote
//! companion, a container runtime, or a scripted fake in tests.
//!
//! Implementations must be `Send + Sync`: the executor is shared across
//! concurrent invocations on the Tokio runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Everything an executor needs for one run.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Argv to spawn; first element is the program.
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Request-supplied environment overrides, applied on top of whatever
    /// baseline the executor maintains.
    pub env: HashMap<String, String>,
    /// Upper bound already clamped by the gatekeeper.
    pub timeout: Duration,
}

/// Outcome of one execution. Non-zero exits and timeouts are results, not
/// errors; an `Err` from [`Executor::execute`] means the executor itself was
/// unreachable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable name for logs and the `host` field of audit events.
    fn name(&self) -> &str;

    /// Run the command to completion (or timeout) and report the outcome.
    async fn execute(&self, spec: ExecSpec) -> anyhow::Result<RunResult>;
}
