//! Handoff ledger record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{AgentType, ConversationKey, Transition};

/// Unique identifier of a handoff record
pub type HandoffId = Uuid;

/// Reason recorded when the sweeper gives up on an execution.
pub const EXECUTION_TIMEOUT: &str = "execution_timeout";
/// Reason recorded when an execution lease is dropped without a result.
pub const ABANDONED: &str = "abandoned";

/// What the decision engine concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Deferred,
    Rejected,
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionOutcome::Approved => write!(f, "approved"),
            DecisionOutcome::Deferred => write!(f, "deferred"),
            DecisionOutcome::Rejected => write!(f, "rejected"),
        }
    }
}

/// Execution state of an approved handoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Approved, transfer not yet acknowledged
    Pending,
    Completed,
    Failed { reason: String },
}

impl ExecutionOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        ExecutionOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionOutcome::Pending)
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Pending => write!(f, "pending"),
            ExecutionOutcome::Completed => write!(f, "completed"),
            ExecutionOutcome::Failed { reason } => write!(f, "failed({reason})"),
        }
    }
}

/// One entry in the append-only handoff ledger.
///
/// Created at decision time for every decision. Only approved records carry
/// an execution outcome, which moves `Pending` to `Completed` or `Failed`
/// exactly once; after that the record is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub id: HandoffId,
    pub conversation_key: ConversationKey,
    pub source_agent: AgentType,
    pub target_agent: AgentType,
    pub confidence: f64,
    pub decided_at: DateTime<Utc>,
    pub decision_outcome: DecisionOutcome,
    /// Machine-readable reason for deferred and rejected decisions
    pub deferral_reason: Option<String>,
    pub execution_outcome: Option<ExecutionOutcome>,
    pub finalized_at: Option<DateTime<Utc>>,
    /// Incremented on every state change; used for compare-and-set finalization
    pub version: u64,
}

impl HandoffRecord {
    /// Record for an approved handoff awaiting execution
    pub fn approved(
        conversation_key: ConversationKey,
        transition: Transition,
        confidence: f64,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_key,
            source_agent: transition.source,
            target_agent: transition.target,
            confidence,
            decided_at,
            decision_outcome: DecisionOutcome::Approved,
            deferral_reason: None,
            execution_outcome: Some(ExecutionOutcome::Pending),
            finalized_at: None,
            version: 0,
        }
    }

    /// Audit record for a deferred or rejected decision
    pub fn declined(
        conversation_key: ConversationKey,
        transition: Transition,
        confidence: f64,
        outcome: DecisionOutcome,
        reason: &str,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_key,
            source_agent: transition.source,
            target_agent: transition.target,
            confidence,
            decided_at,
            decision_outcome: outcome,
            deferral_reason: Some(reason.to_string()),
            execution_outcome: None,
            finalized_at: None,
            version: 0,
        }
    }

    pub fn transition(&self) -> Transition {
        Transition::new(self.source_agent, self.target_agent)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.execution_outcome, Some(ExecutionOutcome::Pending))
    }

    /// When the ownership transfer actually happened, if it did
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self.execution_outcome {
            Some(ExecutionOutcome::Completed) => self.finalized_at,
            _ => None,
        }
    }

    /// Apply a terminal outcome in place.
    pub(crate) fn finalize(&mut self, outcome: ExecutionOutcome, at: DateTime<Utc>) {
        self.execution_outcome = Some(outcome);
        self.finalized_at = Some(at);
        self.version += 1;
    }
}
