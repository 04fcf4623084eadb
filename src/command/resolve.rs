//! Resolve a program token to the canonical filesystem path that would
//! actually execute.
//!
//! Allowlist entries are keyed by real paths, so resolution follows symlinks
//! before any comparison happens — `ln -s /usr/bin/dd ~/bin/echo` must
//! resolve to `/usr/bin/dd`, not to a path an operator already trusted.

use crate::util::program_basename;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// How a program token was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    /// Token was an absolute (or `~`/drive-letter) path.
    Absolute,
    /// Token was a relative path joined against the working directory.
    RelativeToCwd,
    /// Bare name found by PATH search.
    Path,
    /// Name granted by the agent's skill configuration.
    SkillBin,
    /// Resolved inside a trusted safe-bin directory.
    SafeBin,
    /// Nothing on disk matched; `resolved_path` holds the original token.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub resolved_path: PathBuf,
    pub resolved_via: ResolvedVia,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        self.resolved_via != ResolvedVia::Unresolved
    }
}

/// Everything resolution needs from the request and the agent's policy.
pub struct ResolverContext<'a> {
    pub cwd: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub safe_bins: &'a [PathBuf],
    pub skill_bins: &'a HashSet<String>,
    pub auto_allow_skills: bool,
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn expand_user_path(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }

    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }

    PathBuf::from(path)
}

fn starts_with_drive_letter(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_path_like(token: &str) -> bool {
    token.contains('/')
        || token.contains('\\')
        || token.starts_with('~')
        || starts_with_drive_letter(token)
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

fn search_path(token: &str, env: &HashMap<String, String>) -> Option<PathBuf> {
    let path_var = env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok())?;

    for dir in std::env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(token);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn parent_in_safe_bins(resolved: &Path, safe_bins: &[PathBuf]) -> bool {
    let Some(parent) = resolved.parent() else {
        return false;
    };
    safe_bins.iter().any(|dir| {
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        parent == canonical
    })
}

/// Resolve a program token to its canonical path.
///
/// Path-like tokens (`/usr/bin/git`, `./run.sh`, `~/bin/tool`, `C:…`)
/// canonicalize against the working directory; bare names search PATH for
/// the first existing executable. Successful resolutions are then tagged
/// `SafeBin` when the real parent directory is trusted, or `SkillBin` when
/// the agent's skill grants the name and `auto_allow_skills` is on.
pub fn resolve(token: &str, ctx: &ResolverContext<'_>) -> Resolution {
    let unresolved = || Resolution {
        resolved_path: PathBuf::from(token),
        resolved_via: ResolvedVia::Unresolved,
    };

    let (candidate, via) = if is_path_like(token) {
        let expanded = expand_user_path(token);
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            ctx.cwd.join(expanded)
        };
        let via = if token.starts_with('~') || starts_with_drive_letter(token) || Path::new(token).is_absolute()
        {
            ResolvedVia::Absolute
        } else {
            ResolvedVia::RelativeToCwd
        };
        (Some(joined), via)
    } else {
        (search_path(token, ctx.env), ResolvedVia::Path)
    };

    let Some(candidate) = candidate else {
        return unresolved();
    };

    // Canonicalize so symlinks cannot launder an untrusted binary through a
    // trusted-looking path.
    let Ok(real) = candidate.canonicalize() else {
        return unresolved();
    };
    if !is_executable_file(&real) {
        return unresolved();
    }

    let resolved_via = if parent_in_safe_bins(&real, ctx.safe_bins) {
        ResolvedVia::SafeBin
    } else if ctx.auto_allow_skills && ctx.skill_bins.contains(program_basename(token)) {
        ResolvedVia::SkillBin
    } else {
        via
    };

    Resolution {
        resolved_path: real,
        resolved_via,
    }
}
