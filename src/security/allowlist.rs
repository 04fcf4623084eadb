//! Persistent per-agent allowlist of resolved program paths.
//!
//! An entry's pattern is always an absolute canonical filesystem path;
//! lookup is exact-match on the resolved program of each segment. Names,
//! globs, and substrings never match — resolution happens before the store
//! is consulted, so a symlink cannot launder an untrusted binary through a
//! trusted entry.

use crate::command::resolve::{resolve, ResolvedVia, ResolverContext};
use crate::command::shell::{args_contain_metachars, parse_shell, AnalyzedCommand, Op, Redirection};
use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One persisted allowlist record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistEntry {
    /// `None` means the entry applies to every agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Absolute canonical program path.
    pub pattern: String,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub last_used_at_ms: i64,
    #[serde(default)]
    pub last_cmd_text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllowlistFile {
    #[serde(default)]
    entries: Vec<AllowlistEntry>,
}

/// An entry that matched one analyzed segment.
#[derive(Debug, Clone)]
pub struct AllowlistMatch {
    pub segment_index: usize,
    pub entry: AllowlistEntry,
}

/// Result of evaluating an analyzed command against the store.
#[derive(Debug, Clone, Default)]
pub struct AllowlistEvaluation {
    pub matches: Vec<AllowlistMatch>,
    pub satisfied: bool,
}

/// In-process store backed by a JSON file.
///
/// Readers snapshot under the entry lock; disk writes serialize on a
/// separate lock and never happen while the entry lock is held.
pub struct AllowlistStore {
    path: Option<PathBuf>,
    entries: RwLock<Vec<AllowlistEntry>>,
    write_lock: Mutex<()>,
}

impl AllowlistStore {
    /// Store without persistence, for hosts that manage their own durability
    /// and for tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Load the store from `path`; a missing file is an empty store.
    pub fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read allowlist {}", path.display()))?;
            let file: AllowlistFile = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse allowlist {}", path.display()))?;
            dedupe(file.entries)
        } else {
            Vec::new()
        };

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        })
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<AllowlistEntry> {
        self.entries.read().clone()
    }

    /// Insert an entry if an equal (agent, pattern) pair is not already
    /// present. The pattern must be an absolute path.
    pub fn add_entry(&self, agent_id: Option<&str>, pattern: &Path) -> Result<bool> {
        if !pattern.is_absolute() {
            bail!(
                "allowlist pattern must be an absolute path, got {}",
                pattern.display()
            );
        }

        let pattern = pattern.to_string_lossy().to_string();
        let inserted = {
            let mut entries = self.entries.write();
            let exists = entries
                .iter()
                .any(|e| e.agent_id.as_deref() == agent_id && e.pattern == pattern);
            if exists {
                false
            } else {
                let now = crate::util::now_ms();
                entries.push(AllowlistEntry {
                    agent_id: agent_id.map(ToString::to_string),
                    pattern,
                    use_count: 0,
                    created_at_ms: now,
                    last_used_at_ms: now,
                    last_cmd_text: String::new(),
                });
                true
            }
        };

        if inserted {
            self.persist()?;
        }
        Ok(inserted)
    }

    /// Bump usage metadata on the identified entry. Returns `false` when the
    /// entry no longer exists.
    pub fn record_use(&self, agent_id: Option<&str>, pattern: &str, cmd_text: &str) -> bool {
        let found = {
            let mut entries = self.entries.write();
            match entries
                .iter_mut()
                .find(|e| e.agent_id.as_deref() == agent_id && e.pattern == pattern)
            {
                Some(entry) => {
                    entry.use_count += 1;
                    entry.last_used_at_ms = crate::util::now_ms();
                    entry.last_cmd_text = cmd_text.to_string();
                    true
                }
                None => false,
            }
        };

        if found {
            if let Err(e) = self.persist() {
                tracing::warn!("Failed to persist allowlist after use: {e:#}");
            }
        }
        found
    }

    /// Evaluate an analyzed command. `satisfied` requires a sound analysis,
    /// no forbidden operator, and every segment either allowlisted or
    /// auto-satisfied by a safe-bin/skill-bin resolution with clean args.
    pub fn evaluate(&self, analysis: &AnalyzedCommand, agent_id: Option<&str>) -> AllowlistEvaluation {
        let entries = self.entries.read();
        let mut matches = Vec::new();
        let mut all_segments_ok = !analysis.segments.is_empty();

        for (index, segment) in analysis.segments.iter().enumerate() {
            let mut segment_matched = false;

            if let Some(resolution) = &segment.resolution {
                if resolution.is_resolved() {
                    let resolved = resolution.resolved_path.to_string_lossy().to_string();
                    for entry in entries.iter().filter(|e| {
                        e.pattern == resolved
                            && (e.agent_id.is_none() || e.agent_id.as_deref() == agent_id)
                    }) {
                        matches.push(AllowlistMatch {
                            segment_index: index,
                            entry: entry.clone(),
                        });
                        segment_matched = true;
                    }
                }

                // Trusted resolutions auto-satisfy, provided the raw
                // arguments carry no shell structure.
                if !segment_matched
                    && matches!(
                        resolution.resolved_via,
                        ResolvedVia::SafeBin | ResolvedVia::SkillBin
                    )
                    && !args_contain_metachars(segment.argv.get(1..).unwrap_or(&[]))
                {
                    segment_matched = true;
                }
            }

            all_segments_ok &= segment_matched;
        }

        let satisfied =
            analysis.ok && all_segments_ok && !has_forbidden_operator(analysis);

        AllowlistEvaluation { matches, satisfied }
    }

    /// Parse a shell command, resolve each segment's program, and evaluate
    /// the result against the store.
    pub fn evaluate_shell(
        &self,
        command: &str,
        ctx: &ResolverContext<'_>,
        agent_id: Option<&str>,
    ) -> AllowlistEvaluation {
        let mut analysis = parse_shell(command);
        for segment in &mut analysis.segments {
            if let Some(program) = segment.argv.first() {
                segment.resolution = Some(resolve(program, ctx));
            }
        }
        self.evaluate(&analysis, agent_id)
    }

    /// Write-through persistence: serialize a snapshot, then atomically
    /// replace the file (temp write, fsync, rename) under the write lock.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot = AllowlistFile {
            entries: self.entries.read().clone(),
        };
        let serialized =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize allowlist")?;

        let _guard = self.write_lock.lock();
        let tmp_path = path.with_file_name(format!(
            ".{}.tmp-{}",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "allowlist.json".to_string()),
            std::process::id()
        ));

        let mut file = std::fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(serialized.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
        drop(file);

        std::fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to atomically replace {} with {}",
                path.display(),
                tmp_path.display()
            )
        })?;
        Ok(())
    }
}

/// Default-forbidden operators: background chaining, subshells, and
/// redirections whose target escapes the cwd subtree (unless the segment
/// resolved into a safe bin). Substitution never reaches here — the parser
/// already marked those commands unanalyzable.
fn has_forbidden_operator(analysis: &AnalyzedCommand) -> bool {
    if analysis
        .operators
        .iter()
        .any(|op| matches!(op, Op::Background | Op::Subshell))
    {
        return true;
    }

    analysis.segments.iter().any(|segment| {
        let safe_bin = segment
            .resolution
            .as_ref()
            .is_some_and(|r| r.resolved_via == ResolvedVia::SafeBin);
        segment
            .redirections
            .iter()
            .any(|redir| redirection_escapes_cwd(redir) && !safe_bin)
    })
}

fn redirection_escapes_cwd(redir: &Redirection) -> bool {
    match &redir.target {
        None => {
            // fd duplication (`2>&1`, `>&2`) stays inside the process;
            // any other targetless redirection is treated as escaping.
            let is_fd_dup = redir.operator.contains('&')
                && redir
                    .operator
                    .chars()
                    .last()
                    .is_some_and(|c| c.is_ascii_digit());
            !is_fd_dup
        }
        Some(target) => {
            let path = Path::new(target);
            path.is_absolute()
                || target.starts_with('~')
                || path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
        }
    }
}

fn dedupe(entries: Vec<AllowlistEntry>) -> Vec<AllowlistEntry> {
    let mut merged: HashMap<(Option<String>, String), AllowlistEntry> = HashMap::new();
    for entry in entries {
        let key = (entry.agent_id.clone(), entry.pattern.clone());
        match merged.get_mut(&key) {
            None => {
                merged.insert(key, entry);
            }
            Some(existing) => {
                if entry.last_used_at_ms >= existing.last_used_at_ms {
                    existing.last_used_at_ms = entry.last_used_at_ms;
                    existing.last_cmd_text = entry.last_cmd_text;
                }
                existing.use_count = existing.use_count.max(entry.use_count);
                existing.created_at_ms = if existing.created_at_ms == 0 {
                    entry.created_at_ms
                } else {
                    existing.created_at_ms.min(entry.created_at_ms)
                };
            }
        }
    }
    let mut out: Vec<AllowlistEntry> = merged.into_values().collect();
    out.sort_by(|a, b| (&a.agent_id, &a.pattern).cmp(&(&b.agent_id, &b.pattern)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::resolve::Resolution;
    use crate::command::shell::{parse_shell, Segment};

    fn resolved_analysis(paths: &[&str]) -> AnalyzedCommand {
        AnalyzedCommand {
            ok: true,
            segments: paths
                .iter()
                .map(|p| Segment {
                    argv: vec![p.to_string()],
                    redirections: Vec::new(),
                    resolution: Some(Resolution {
                        resolved_path: PathBuf::from(p),
                        resolved_via: ResolvedVia::Absolute,
                    }),
                })
                .collect(),
            operators: Vec::new(),
        }
    }

    fn store_with(patterns: &[(&str, Option<&str>)]) -> AllowlistStore {
        let store = AllowlistStore::in_memory();
        for (pattern, agent) in patterns {
            store.add_entry(*agent, Path::new(pattern)).unwrap();
        }
        store
    }

    // ── add_entry / record_use ───────────────────────────────

    #[test]
    fn add_entry_is_idempotent() {
        let store = AllowlistStore::in_memory();
        assert!(store.add_entry(None, Path::new("/usr/bin/echo")).unwrap());
        assert!(!store.add_entry(None, Path::new("/usr/bin/echo")).unwrap());
        assert_eq!(store.entries().len(), 1);

        // Same pattern for a specific agent is a distinct entry.
        assert!(store
            .add_entry(Some("builder"), Path::new("/usr/bin/echo"))
            .unwrap());
        assert_eq!(store.entries().len(), 2);
    }

    #[test]
    fn add_entry_rejects_relative_pattern() {
        let store = AllowlistStore::in_memory();
        assert!(store.add_entry(None, Path::new("echo")).is_err());
        assert!(store.add_entry(None, Path::new("./bin/echo")).is_err());
    }

    #[test]
    fn record_use_updates_metadata() {
        let store = store_with(&[("/usr/bin/echo", None)]);
        assert!(store.record_use(None, "/usr/bin/echo", "echo hi"));
        assert!(store.record_use(None, "/usr/bin/echo", "echo again"));

        let entry = &store.entries()[0];
        assert_eq!(entry.use_count, 2);
        assert_eq!(entry.last_cmd_text, "echo again");
        assert!(entry.last_used_at_ms >= entry.created_at_ms);

        assert!(!store.record_use(None, "/usr/bin/missing", "x"));
    }

    // ── evaluate ─────────────────────────────────────────────

    #[test]
    fn every_segment_must_match() {
        let store = store_with(&[("/bin/ls", None)]);

        let eval = store.evaluate(&resolved_analysis(&["/bin/ls"]), None);
        assert!(eval.satisfied);
        assert_eq!(eval.matches.len(), 1);

        let eval = store.evaluate(&resolved_analysis(&["/bin/ls", "/bin/grep"]), None);
        assert!(!eval.satisfied);
        assert_eq!(eval.matches.len(), 1);
        assert_eq!(eval.matches[0].segment_index, 0);
    }

    #[test]
    fn agent_entries_do_not_leak_across_agents() {
        let store = store_with(&[("/bin/ls", Some("builder"))]);

        assert!(store
            .evaluate(&resolved_analysis(&["/bin/ls"]), Some("builder"))
            .satisfied);
        assert!(!store
            .evaluate(&resolved_analysis(&["/bin/ls"]), Some("other"))
            .satisfied);
        assert!(!store.evaluate(&resolved_analysis(&["/bin/ls"]), None).satisfied);
    }

    #[test]
    fn global_entries_apply_to_all_agents() {
        let store = store_with(&[("/bin/ls", None)]);
        assert!(store
            .evaluate(&resolved_analysis(&["/bin/ls"]), Some("anyone"))
            .satisfied);
    }

    #[test]
    fn unresolved_segment_never_satisfies() {
        let store = store_with(&[("/bin/ls", None)]);
        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.segments[0].resolution = Some(Resolution {
            resolved_path: PathBuf::from("mystery"),
            resolved_via: ResolvedVia::Unresolved,
        });
        assert!(!store.evaluate(&analysis, None).satisfied);
    }

    #[test]
    fn failed_analysis_never_satisfies() {
        let store = store_with(&[("/bin/ls", None)]);
        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.ok = false;
        assert!(!store.evaluate(&analysis, None).satisfied);
    }

    #[test]
    fn background_and_subshell_operators_are_forbidden() {
        let store = store_with(&[("/bin/ls", None)]);

        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.operators.push(Op::Background);
        assert!(!store.evaluate(&analysis, None).satisfied);

        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.operators.push(Op::Subshell);
        assert!(!store.evaluate(&analysis, None).satisfied);

        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.operators.push(Op::Pipe);
        assert!(store.evaluate(&analysis, None).satisfied);
    }

    #[test]
    fn redirection_outside_cwd_is_forbidden() {
        let store = store_with(&[("/bin/ls", None)]);

        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.segments[0].redirections.push(Redirection {
            operator: ">".to_string(),
            target: Some("/etc/crontab".to_string()),
        });
        assert!(!store.evaluate(&analysis, None).satisfied);

        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.segments[0].redirections.push(Redirection {
            operator: ">>".to_string(),
            target: Some("../outside.txt".to_string()),
        });
        assert!(!store.evaluate(&analysis, None).satisfied);

        // Relative target inside the cwd subtree is fine.
        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.segments[0].redirections.push(Redirection {
            operator: ">".to_string(),
            target: Some("out/listing.txt".to_string()),
        });
        assert!(store.evaluate(&analysis, None).satisfied);

        // fd duplication is not a filesystem write.
        let mut analysis = resolved_analysis(&["/bin/ls"]);
        analysis.segments[0].redirections.push(Redirection {
            operator: "2>&1".to_string(),
            target: None,
        });
        assert!(store.evaluate(&analysis, None).satisfied);
    }

    #[test]
    fn safe_bin_segment_may_redirect_anywhere() {
        let store = AllowlistStore::in_memory();
        let mut analysis = resolved_analysis(&["/opt/safe/fmt"]);
        analysis.segments[0].resolution = Some(Resolution {
            resolved_path: PathBuf::from("/opt/safe/fmt"),
            resolved_via: ResolvedVia::SafeBin,
        });
        analysis.segments[0].redirections.push(Redirection {
            operator: ">".to_string(),
            target: Some("/var/log/fmt.log".to_string()),
        });
        assert!(store.evaluate(&analysis, None).satisfied);
    }

    #[test]
    fn safe_bin_auto_satisfies_with_clean_args() {
        let store = AllowlistStore::in_memory();
        let mut analysis = resolved_analysis(&["/opt/safe/fmt"]);
        analysis.segments[0].argv = vec!["fmt".to_string(), "--check".to_string()];
        analysis.segments[0].resolution = Some(Resolution {
            resolved_path: PathBuf::from("/opt/safe/fmt"),
            resolved_via: ResolvedVia::SafeBin,
        });
        assert!(store.evaluate(&analysis, None).satisfied);

        // Metacharacters in args break the auto-satisfy shortcut.
        analysis.segments[0].argv = vec!["fmt".to_string(), "a&&b".to_string()];
        assert!(!store.evaluate(&analysis, None).satisfied);
    }

    #[test]
    fn skill_bin_auto_satisfies_like_safe_bin() {
        let store = AllowlistStore::in_memory();
        let mut analysis = resolved_analysis(&["/home/agent/.skills/bin/deploy"]);
        analysis.segments[0].argv = vec!["deploy".to_string(), "staging".to_string()];
        analysis.segments[0].resolution = Some(Resolution {
            resolved_path: PathBuf::from("/home/agent/.skills/bin/deploy"),
            resolved_via: ResolvedVia::SkillBin,
        });
        assert!(store.evaluate(&analysis, None).satisfied);
    }

    #[test]
    fn injection_corpus_is_never_satisfied() {
        // Commands that must never be allowlist-satisfied regardless of
        // which entries exist, because analysis or operators reject them.
        let store = store_with(&[("/bin/echo", None), ("/bin/ls", None)]);
        let corpus = [
            "echo $(rm -rf /)",
            "echo `whoami`",
            "echo hi & rm -rf /",
            "(echo hi)",
            "echo hi > /etc/passwd",
            "ls > ../../exfil.txt",
            "FOO=bar echo hi",
            "echo ${HOME}",
            "diff <(ls) <(ls ..)",
            "echo 'fine' ; echo \"also fine\"`uname`",
        ];
        for command in corpus {
            let analysis = parse_shell(command);
            let eval = store.evaluate(&analysis, None);
            assert!(!eval.satisfied, "corpus command was satisfied: {command}");
        }
    }

    #[test]
    #[cfg(unix)]
    fn evaluate_shell_resolves_and_checks_each_segment() {
        use std::collections::{HashMap, HashSet};
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let bin_dir = tmp.path().join("bin");
        std::fs::create_dir(&bin_dir).unwrap();
        for name in ["ls", "grep"] {
            let path = bin_dir.join(name);
            std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }

        let mut env = HashMap::new();
        env.insert("PATH".to_string(), bin_dir.display().to_string());
        let safe: Vec<PathBuf> = Vec::new();
        let skills: HashSet<String> = HashSet::new();
        let ctx = ResolverContext {
            cwd: tmp.path(),
            env: &env,
            safe_bins: &safe,
            skill_bins: &skills,
            auto_allow_skills: false,
        };

        let store = AllowlistStore::in_memory();
        store
            .add_entry(None, &bin_dir.join("ls").canonicalize().unwrap())
            .unwrap();

        // Only the first segment is allowlisted.
        assert!(store.evaluate_shell("ls", &ctx, None).satisfied);
        assert!(!store.evaluate_shell("ls | grep foo", &ctx, None).satisfied);

        store
            .add_entry(None, &bin_dir.join("grep").canonicalize().unwrap())
            .unwrap();
        assert!(store.evaluate_shell("ls | grep foo", &ctx, None).satisfied);

        // Injection through the pipe is still rejected by analysis.
        assert!(!store.evaluate_shell("ls | grep `uname`", &ctx, None).satisfied);
    }

    // ── persistence ──────────────────────────────────────────

    #[test]
    fn persist_and_reload_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("allowlist.json");

        let store = AllowlistStore::load(path.clone()).unwrap();
        store.add_entry(None, Path::new("/usr/bin/echo")).unwrap();
        store
            .add_entry(Some("builder"), Path::new("/usr/bin/git"))
            .unwrap();
        store.record_use(None, "/usr/bin/echo", "echo hi");

        let reloaded = AllowlistStore::load(path).unwrap();
        let entries = reloaded.entries();
        assert_eq!(entries.len(), 2);
        let echo = entries.iter().find(|e| e.pattern == "/usr/bin/echo").unwrap();
        assert_eq!(echo.use_count, 1);
        assert_eq!(echo.last_cmd_text, "echo hi");
    }

    #[test]
    fn load_ignores_unknown_fields_and_dedupes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("allowlist.json");
        std::fs::write(
            &path,
            r#"{
                "entries": [
                    {"agentId": null, "pattern": "/bin/ls", "useCount": 3,
                     "createdAtMs": 100, "lastUsedAtMs": 200,
                     "lastCmdText": "ls -la", "futureField": true},
                    {"agentId": null, "pattern": "/bin/ls", "useCount": 7,
                     "createdAtMs": 50, "lastUsedAtMs": 150,
                     "lastCmdText": "ls"}
                ],
                "futureTopLevel": {}
            }"#,
        )
        .unwrap();

        let store = AllowlistStore::load(path).unwrap();
        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].use_count, 7);
        assert_eq!(entries[0].created_at_ms, 50);
        assert_eq!(entries[0].last_used_at_ms, 200);
        assert_eq!(entries[0].last_cmd_text, "ls -la");
    }

    #[test]
    fn missing_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AllowlistStore::load(tmp.path().join("nope.json")).unwrap();
        assert!(store.entries().is_empty());
    }
}
