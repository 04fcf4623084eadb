//! Gatekeeper configuration, loaded from `config.toml`.
//!
//! A global `[security]` table sets the default policy; `[agents.<id>]`
//! tables override it per agent. Every field has a serde default so a
//! missing or partial file degrades to the safe baseline (allowlist
//! security, ask-on-untrusted).

use crate::security::{AskMode, SecurityMode};
use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default upper bound on executor time: 30 minutes.
fn default_max_timeout_ms() -> u64 {
    30 * 60 * 1000
}

/// Default per-stream output cap in events: 64 KiB.
fn default_max_output_bytes() -> usize {
    64 * 1024
}

/// Default approval TTL: one hour.
fn default_approval_ttl_ms() -> i64 {
    60 * 60 * 1000
}

/// Global security policy (`[security]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SecurityConfig {
    /// Security mode: `off`, `allowlist` (default), or `deny`.
    pub security: SecurityMode,
    /// When to ask the operator: `never`, `untrusted` (default), `always`.
    pub ask: AskMode,
    /// Trusted directories; programs resolving inside them auto-satisfy the
    /// allowlist.
    pub safe_bins: Vec<PathBuf>,
    /// Program names granted by skill configuration.
    pub skill_bins: Vec<String>,
    /// Honor `skill_bins` without explicit allowlist entries.
    pub auto_allow_skills: bool,
}

/// Per-agent overrides (`[agents.<id>]`). Unset fields inherit the global
/// `[security]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AgentSecurityConfig {
    pub security: Option<SecurityMode>,
    pub ask: Option<AskMode>,
    pub safe_bins: Option<Vec<PathBuf>>,
    pub skill_bins: Option<Vec<String>>,
    pub auto_allow_skills: Option<bool>,
}

/// Executor limits (`[exec]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExecConfig {
    /// Hard ceiling on a single execution, applied over any request value.
    pub max_timeout_ms: u64,
    /// Per-stream stdout/stderr cap in emitted events.
    pub max_output_bytes: usize,
    /// Extra environment variable names passed through to subprocesses on
    /// top of the safe baseline.
    pub env_passthrough: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_timeout_ms: default_max_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            env_passthrough: Vec::new(),
        }
    }
}

/// Approval lifecycle settings (`[approvals]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ApprovalsConfig {
    /// How long a pending approval stays resolvable.
    pub ttl_ms: i64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_approval_ttl_ms(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Path this config was loaded from. Computed, never serialized.
    #[serde(skip)]
    #[schemars(skip)]
    pub config_path: PathBuf,

    pub security: SecurityConfig,
    pub agents: HashMap<String, AgentSecurityConfig>,
    pub exec: ExecConfig,
    pub approvals: ApprovalsConfig,

    /// Where the persistent allowlist lives. Defaults to `allowlist.json`
    /// next to the config file.
    pub allowlist_path: Option<PathBuf>,
}

impl Config {
    /// Load from `path`, or return defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                config_path: path.to_path_buf(),
                ..Self::default()
            });
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Resolved allowlist file location.
    pub fn allowlist_path(&self) -> PathBuf {
        if let Some(path) = &self.allowlist_path {
            return path.clone();
        }
        self.config_path
            .parent()
            .map(|dir| dir.join("allowlist.json"))
            .unwrap_or_else(|| PathBuf::from("allowlist.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let config = Config::default();
        assert_eq!(config.security.security, SecurityMode::Allowlist);
        assert_eq!(config.security.ask, AskMode::Untrusted);
        assert!(!config.security.auto_allow_skills);
        assert_eq!(config.exec.max_timeout_ms, 30 * 60 * 1000);
        assert_eq!(config.approvals.ttl_ms, 60 * 60 * 1000);
    }

    #[test]
    fn parses_partial_toml() {
        let toml_src = r#"
            [security]
            security = "off"
            ask = "always"
            safe_bins = ["/opt/tools/bin"]

            [agents.builder]
            security = "allowlist"
            auto_allow_skills = true

            [exec]
            max_timeout_ms = 60000
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.security.security, SecurityMode::Off);
        assert_eq!(config.security.ask, AskMode::Always);
        assert_eq!(config.security.safe_bins, vec![PathBuf::from("/opt/tools/bin")]);
        assert_eq!(
            config.agents["builder"].security,
            Some(SecurityMode::Allowlist)
        );
        assert_eq!(config.agents["builder"].auto_allow_skills, Some(true));
        assert_eq!(config.exec.max_timeout_ms, 60000);
        // Unset sections keep defaults.
        assert_eq!(config.approvals.ttl_ms, 60 * 60 * 1000);
    }

    #[test]
    fn load_or_default_for_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.config_path, path);
        assert_eq!(config.security.security, SecurityMode::Allowlist);
        assert_eq!(config.allowlist_path(), tmp.path().join("allowlist.json"));
    }

    #[test]
    fn explicit_allowlist_path_wins() {
        let config = Config {
            allowlist_path: Some(PathBuf::from("/var/lib/clawgate/allow.json")),
            ..Config::default()
        };
        assert_eq!(
            config.allowlist_path(),
            PathBuf::from("/var/lib/clawgate/allow.json")
        );
    }
}
