//! Audit events emitted at every decision point.
//!
//! Exactly one of `exec.denied` / `exec.finished` fires per accepted
//! request; rejected request shapes (`INVALID_REQUEST`) emit nothing.

use crate::util::floor_utf8_char_boundary;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Literal suffix appended when stream output is cut at the cap.
pub const TRUNCATION_MARKER: &str = "... (truncated)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ExecEvent {
    #[serde(rename = "exec.denied", rename_all = "camelCase")]
    Denied {
        session_key: Option<String>,
        run_id: String,
        host: String,
        command: String,
        reason: String,
    },
    #[serde(rename = "exec.finished", rename_all = "camelCase")]
    Finished {
        session_key: Option<String>,
        run_id: String,
        cmd_text: String,
        exit_code: Option<i32>,
        timed_out: bool,
        success: bool,
        stdout: String,
        stderr: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ExecEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Denied { run_id, .. } | Self::Finished { run_id, .. } => run_id,
        }
    }
}

/// Destination for audit events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ExecEvent);
}

/// Sink that writes events to the tracing log as JSON lines.
#[derive(Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: ExecEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "clawgate::events", "{json}"),
            Err(e) => tracing::warn!("Failed to serialize exec event: {e}"),
        }
    }
}

/// In-memory sink for tests and embedders that poll.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: ExecEvent) {
        self.events.lock().push(event);
    }
}

/// Cap both streams at `max_bytes` (on a char boundary) and append the
/// truncation marker to stderr when non-empty, else stdout.
pub fn truncate_streams(
    mut stdout: String,
    mut stderr: String,
    max_bytes: usize,
) -> (String, String) {
    let mut truncated = false;

    if stdout.len() > max_bytes {
        stdout.truncate(floor_utf8_char_boundary(&stdout, max_bytes));
        truncated = true;
    }
    if stderr.len() > max_bytes {
        stderr.truncate(floor_utf8_char_boundary(&stderr, max_bytes));
        truncated = true;
    }

    if truncated {
        if stderr.is_empty() {
            stdout.push_str(TRUNCATION_MARKER);
        } else {
            stderr.push_str(TRUNCATION_MARKER);
        }
    }

    (stdout, stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let event = ExecEvent::Denied {
            session_key: Some("s1".to_string()),
            run_id: "r1".to_string(),
            host: "native".to_string(),
            command: "echo hi".to_string(),
            reason: "allowlist-miss".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "exec.denied");
        assert_eq!(json["sessionKey"], "s1");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["reason"], "allowlist-miss");

        let event = ExecEvent::Finished {
            session_key: None,
            run_id: "r2".to_string(),
            cmd_text: "echo hi".to_string(),
            exit_code: Some(0),
            timed_out: false,
            success: true,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "exec.finished");
        assert_eq!(json["cmdText"], "echo hi");
        assert_eq!(json["exitCode"], 0);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn truncation_prefers_stderr_for_the_marker() {
        let big = "x".repeat(100);
        let (out, err) = truncate_streams(big.clone(), "boom".to_string(), 10);
        assert_eq!(out.len(), 10);
        assert!(err.ends_with(TRUNCATION_MARKER));

        let (out, err) = truncate_streams(big.clone(), String::new(), 10);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(err.is_empty());

        // Under the cap nothing changes.
        let (out, err) = truncate_streams("ok".to_string(), "fine".to_string(), 10);
        assert_eq!(out, "ok");
        assert_eq!(err, "fine");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let crabs = "🦀".repeat(10); // 40 bytes
        let (out, _) = truncate_streams(crabs, String::new(), 10);
        // 10 is not a boundary of a 4-byte sequence run; floor lands on 8.
        assert!(out.starts_with("🦀🦀"));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(ExecEvent::Denied {
            session_key: None,
            run_id: "a".to_string(),
            host: "h".to_string(),
            command: "c".to_string(),
            reason: "cancelled".to_string(),
        })
        .await;
        sink.emit(ExecEvent::Finished {
            session_key: None,
            run_id: "b".to_string(),
            cmd_text: "c".to_string(),
            exit_code: Some(0),
            timed_out: false,
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        })
        .await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].run_id(), "a");
        assert_eq!(events[1].run_id(), "b");
    }
}
