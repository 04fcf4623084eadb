//! Security policy and allowlist evaluation.
//!
//! `policy` owns the decision matrix (allow / ask / deny); `allowlist` owns
//! the persistent store of approved program paths. Both are consulted by the
//! gatekeeper on every request.

pub mod allowlist;
pub mod policy;

pub use allowlist::{AllowlistEntry, AllowlistEvaluation, AllowlistMatch, AllowlistStore};
pub use policy::{
    final_decision, requires_approval, ApprovalInput, AskMode, Decision, DecisionInput,
    DenyReason, EvalContext, Policy, SecurityMode,
};
