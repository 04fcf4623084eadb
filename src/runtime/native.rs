//! Native subprocess executor.

use super::traits::{ExecSpec, Executor, RunResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Stdio;

/// Environment variables safe to pass to child processes.
/// Only functional variables are included, never API keys or secrets.
const SAFE_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "TERM", "LANG", "LC_ALL", "LC_CTYPE", "USER", "SHELL", "TMPDIR",
];

fn is_valid_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Executes argv directly on the local host via `tokio::process`.
///
/// The child environment is cleared and rebuilt from the safe baseline, the
/// configured passthrough names, and the request's explicit overrides, in
/// that order. The child is killed when the timeout elapses or the spawning
/// future is dropped.
pub struct NativeExecutor {
    env_passthrough: Vec<String>,
}

impl NativeExecutor {
    pub fn new(env_passthrough: Vec<String>) -> Self {
        Self { env_passthrough }
    }

    fn baseline_env_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for key in SAFE_ENV_VARS
            .iter()
            .copied()
            .chain(self.env_passthrough.iter().map(String::as_str))
        {
            let candidate = key.trim();
            if candidate.is_empty() || !is_valid_env_var_name(candidate) {
                continue;
            }
            if seen.insert(candidate.to_string()) {
                out.push(candidate.to_string());
            }
        }
        out
    }
}

impl Default for NativeExecutor {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Executor for NativeExecutor {
    fn name(&self) -> &str {
        "native"
    }

    async fn execute(&self, spec: ExecSpec) -> anyhow::Result<RunResult> {
        let Some(program) = spec.argv.first() else {
            anyhow::bail!("empty argv");
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&spec.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        cmd.env_clear();
        for name in self.baseline_env_names() {
            if let Ok(value) = std::env::var(&name) {
                cmd.env(&name, value);
            }
        }
        for (name, value) in &spec.env {
            if is_valid_env_var_name(name) {
                cmd.env(name, value);
            }
        }

        match tokio::time::timeout(spec.timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code();
                Ok(RunResult {
                    exit_code,
                    timed_out: false,
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    error: None,
                })
            }
            Ok(Err(e)) => Ok(RunResult {
                exit_code: None,
                timed_out: false,
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("Failed to execute command: {e}")),
            }),
            // Dropping the output future kills the child (kill_on_drop).
            Err(_) => Ok(RunResult {
                exit_code: None,
                timed_out: true,
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!(
                    "Command timed out after {}ms and was killed",
                    spec.timeout.as_millis()
                )),
            }),
        }
    }
}
