//! Decision types produced by the handoff engine

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::lease::ExecutionLease;
use crate::intent::ProfileError;
use crate::state::{DecisionOutcome, HandoffId, HandoffRecord};
use crate::types::{AgentType, ConversationKey, Transition};

/// Why a handoff was not approved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Target confidence below the transition's threshold
    BelowConfidence,
    /// Hourly or daily cap reached for the conversation
    RateLimited,
    /// Reverse or repeat of a recently completed handoff
    Circular,
    /// Target agent is outside its SLA or error budget
    TargetDegraded,
    /// Another handoff holds the conversation's lease
    InFlight,
    /// The ledger or rate-limit store could not be reached
    PersistenceUnavailable,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::BelowConfidence => "below_confidence",
            DecisionReason::RateLimited => "rate_limited",
            DecisionReason::Circular => "circular",
            DecisionReason::TargetDegraded => "target_degraded",
            DecisionReason::InFlight => "in_flight",
            DecisionReason::PersistenceUnavailable => "persistence_unavailable",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller error: the request itself is invalid
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("conversation key must not be blank")]
    EmptyKey,

    #[error("source and target are both {0}")]
    SelfTransition(AgentType),

    #[error("invalid intent profile: {0}")]
    InvalidProfile(#[from] ProfileError),
}

/// Approved handoff: the pending ledger record plus the lease that guards it.
///
/// The holder must finalize through the lease. Dropping it without doing so
/// marks the record failed and frees the conversation.
#[derive(Debug)]
pub struct ApprovedHandoff {
    pub record: HandoffRecord,
    pub lease: ExecutionLease,
}

impl ApprovedHandoff {
    pub fn request(&self) -> ExecutionRequest {
        ExecutionRequest {
            record_id: self.record.id,
            conversation_key: self.record.conversation_key.clone(),
            transition: self.record.transition(),
            confidence: self.record.confidence,
            lease_expires_at: self.lease.expires_at(),
        }
    }
}

/// What the runtime needs to perform the ownership transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub record_id: HandoffId,
    pub conversation_key: ConversationKey,
    pub transition: Transition,
    pub confidence: f64,
    /// The transfer must be acknowledged before this instant.
    pub lease_expires_at: DateTime<Utc>,
}

/// Engine verdict for one handoff request
#[derive(Debug)]
pub enum Decision {
    Approved(ApprovedHandoff),
    /// Temporarily blocked; worth retrying after `retry_after`
    Deferred {
        reason: DecisionReason,
        retry_after: Duration,
        record_id: Option<HandoffId>,
    },
    Rejected {
        reason: DecisionReason,
        record_id: Option<HandoffId>,
    },
}

impl Decision {
    pub fn outcome(&self) -> DecisionOutcome {
        match self {
            Decision::Approved(_) => DecisionOutcome::Approved,
            Decision::Deferred { .. } => DecisionOutcome::Deferred,
            Decision::Rejected { .. } => DecisionOutcome::Rejected,
        }
    }

    /// Machine-readable reason; `"approved"` for approvals
    pub fn reason(&self) -> &'static str {
        match self {
            Decision::Approved(_) => "approved",
            Decision::Deferred { reason, .. } | Decision::Rejected { reason, .. } => {
                reason.as_str()
            }
        }
    }

    pub fn decline_reason(&self) -> Option<DecisionReason> {
        match self {
            Decision::Approved(_) => None,
            Decision::Deferred { reason, .. } | Decision::Rejected { reason, .. } => Some(*reason),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approved(_))
    }

    pub fn record_id(&self) -> Option<HandoffId> {
        match self {
            Decision::Approved(approved) => Some(approved.record.id),
            Decision::Deferred { record_id, .. } | Decision::Rejected { record_id, .. } => {
                *record_id
            }
        }
    }

    pub fn into_approved(self) -> Option<ApprovedHandoff> {
        match self {
            Decision::Approved(approved) => Some(approved),
            _ => None,
        }
    }

    /// Serializable view of the decision
    pub fn summary(&self) -> DecisionSummary {
        DecisionSummary {
            outcome: self.outcome(),
            reason: self.reason().to_string(),
            record_id: self.record_id(),
            retry_after_secs: match self {
                Decision::Deferred { retry_after, .. } => Some(retry_after.num_seconds()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub outcome: DecisionOutcome,
    pub reason: String,
    pub record_id: Option<HandoffId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
}
