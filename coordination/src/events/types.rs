//! Event types for handoff coordination
//!
//! Emitted after every decision and state change so dashboards and the
//! runtime can observe the coordinator without polling the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{DecisionOutcome, ExecutionOutcome, HandoffId};
use crate::types::{AgentType, ConversationKey, Transition};

/// All handoff coordination events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandoffEvent {
    /// The engine reached a decision for a handoff request
    DecisionMade {
        record_id: Option<HandoffId>,
        conversation_key: ConversationKey,
        source: AgentType,
        target: AgentType,
        confidence: f64,
        outcome: DecisionOutcome,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// An approved handoff reached a terminal execution outcome
    ExecutionFinalized {
        record_id: HandoffId,
        conversation_key: ConversationKey,
        outcome: ExecutionOutcome,
        timestamp: DateTime<Utc>,
    },

    /// The sweeper removed an expired lease
    LeaseReclaimed {
        conversation_key: ConversationKey,
        token: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// The learner moved a transition's threshold
    ThresholdCalibrated {
        transition: Transition,
        previous: f64,
        threshold: f64,
        sample_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A new configuration was published
    ConfigReloaded { timestamp: DateTime<Utc> },
}

impl HandoffEvent {
    /// Get the event timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HandoffEvent::DecisionMade { timestamp, .. }
            | HandoffEvent::ExecutionFinalized { timestamp, .. }
            | HandoffEvent::LeaseReclaimed { timestamp, .. }
            | HandoffEvent::ThresholdCalibrated { timestamp, .. }
            | HandoffEvent::ConfigReloaded { timestamp } => *timestamp,
        }
    }

    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            HandoffEvent::DecisionMade { .. } => "decision_made",
            HandoffEvent::ExecutionFinalized { .. } => "execution_finalized",
            HandoffEvent::LeaseReclaimed { .. } => "lease_reclaimed",
            HandoffEvent::ThresholdCalibrated { .. } => "threshold_calibrated",
            HandoffEvent::ConfigReloaded { .. } => "config_reloaded",
        }
    }

    /// Conversation the event concerns, if any
    pub fn conversation_key(&self) -> Option<&ConversationKey> {
        match self {
            HandoffEvent::DecisionMade {
                conversation_key, ..
            }
            | HandoffEvent::ExecutionFinalized {
                conversation_key, ..
            }
            | HandoffEvent::LeaseReclaimed {
                conversation_key, ..
            } => Some(conversation_key),
            HandoffEvent::ThresholdCalibrated { .. } | HandoffEvent::ConfigReloaded { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = HandoffEvent::DecisionMade {
            record_id: None,
            conversation_key: ConversationKey::new("contact-1"),
            source: AgentType::Lead,
            target: AgentType::Buyer,
            confidence: 0.55,
            outcome: DecisionOutcome::Rejected,
            reason: "below_confidence".to_string(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"decision_made""#));
        assert!(json.contains(r#""outcome":"rejected""#));

        let parsed: HandoffEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_conversation_key_accessor() {
        let event = HandoffEvent::ConfigReloaded {
            timestamp: Utc::now(),
        };
        assert_eq!(event.conversation_key(), None);
        assert_eq!(event.event_type(), "config_reloaded");
    }
}
