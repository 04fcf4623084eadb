#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_wraps
)]

//! clawgate — the command execution gatekeeper of a remote-agent runtime.
//!
//! An agent asks the host to execute a command; the gatekeeper decides
//! whether it may run, binds it to any prior operator approval, records its
//! allowlist use, and forwards it to an executor. The design goal is that
//! command injection through the approval channel is impossible: the text an
//! operator approves is exactly what executes.

pub mod approval;
pub mod command;
pub mod config;
pub mod gatekeeper;
pub mod runtime;
pub mod security;
pub(crate) mod util;

pub use approval::{ApprovalManager, ApprovalRecord, RecordDecision, Requester};
pub use command::{normalize, ApprovalDecision, ExecRequest, NormalizedCommand};
pub use config::Config;
pub use gatekeeper::events::{EventSink, ExecEvent, MemorySink, TracingSink};
pub use gatekeeper::{Gatekeeper, Reply};
pub use runtime::{ExecSpec, Executor, NativeExecutor, RunResult};
pub use security::{AllowlistStore, AskMode, Policy, SecurityMode};
