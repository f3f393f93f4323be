//! Handoff decisions
//!
//! [`HandoffDecisionEngine`] turns an intent profile into a [`Decision`].
//! Approvals carry an [`ExecutionLease`] that the runtime finalizes once the
//! transfer has happened (or failed).

pub mod engine;
pub mod lease;
pub mod types;

pub use engine::{EngineParts, HandoffDecisionEngine};
pub use lease::ExecutionLease;
pub use types::{
    ApprovedHandoff, Decision, DecisionReason, DecisionSummary, EngineError, ExecutionRequest,
};
