//! Intent analysis
//!
//! Turns a conversation transcript into an [`IntentProfile`]: overall
//! readiness and commitment scores plus a confidence per candidate target
//! agent. The engine only consumes the profile; any analyzer implementing
//! [`IntentAnalyzer`] can be plugged in. [`PatternAnalyzer`] is the built-in
//! phrase-family matcher.

pub mod patterns;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{AgentType, Message};

pub use patterns::PatternAnalyzer;

/// Analyzer output for one transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentProfile {
    /// 0-100, how close the contact is to acting
    pub readiness_score: f64,
    /// 0-100, how engaged the contact is in the conversation
    pub commitment_score: f64,
    /// Per target agent, each in `[0, 1]`
    pub target_confidence: BTreeMap<AgentType, f64>,
    /// Names of the phrase families that matched
    pub detected_signals: Vec<String>,
}

impl Default for IntentProfile {
    fn default() -> Self {
        Self::floor()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProfileError {
    #[error("{field} score {value} is outside [0, 100]")]
    ScoreOutOfRange { field: &'static str, value: f64 },

    #[error("confidence for {agent} is {value}, expected [0, 1]")]
    ConfidenceOutOfRange { agent: AgentType, value: f64 },
}

impl IntentProfile {
    /// Profile with no evidence: every score and confidence at zero.
    pub fn floor() -> Self {
        Self {
            readiness_score: 0.0,
            commitment_score: 0.0,
            target_confidence: AgentType::all().iter().map(|a| (*a, 0.0)).collect(),
            detected_signals: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, agent: AgentType, confidence: f64) -> Self {
        self.target_confidence.insert(agent, confidence);
        self
    }

    /// Confidence for `agent`, zero when the analyzer did not score it.
    pub fn confidence_for(&self, agent: AgentType) -> f64 {
        self.target_confidence.get(&agent).copied().unwrap_or(0.0)
    }

    /// Highest-confidence agent other than `current`, ties broken by agent order.
    pub fn best_target(&self, current: AgentType) -> Option<(AgentType, f64)> {
        AgentType::all()
            .iter()
            .filter(|a| **a != current)
            .map(|a| (*a, self.confidence_for(*a)))
            .fold(None, |best, candidate| match best {
                Some((_, c)) if c >= candidate.1 => best,
                _ => Some(candidate),
            })
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        for (field, value) in [
            ("readiness", self.readiness_score),
            ("commitment", self.commitment_score),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ProfileError::ScoreOutOfRange { field, value });
            }
        }
        for (agent, value) in &self.target_confidence {
            if !(0.0..=1.0).contains(value) {
                return Err(ProfileError::ConfidenceOutOfRange {
                    agent: *agent,
                    value: *value,
                });
            }
        }
        Ok(())
    }
}

/// Malformed transcript.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("message {index} has no content")]
    EmptyMessage { index: usize },

    #[error("message {index} is older than the message before it")]
    OutOfOrder { index: usize },
}

/// Produces an intent profile from a transcript.
///
/// An empty history yields [`IntentProfile::floor`]. Implementations must be
/// pure: the same transcript always produces the same profile.
pub trait IntentAnalyzer: Send + Sync {
    fn analyze(&self, history: &[Message]) -> Result<IntentProfile, AnalysisError>;
}

/// Structural checks shared by analyzers.
pub fn validate_history(history: &[Message]) -> Result<(), AnalysisError> {
    for (index, message) in history.iter().enumerate() {
        if message.content.trim().is_empty() {
            return Err(AnalysisError::EmptyMessage { index });
        }
        if index > 0 && message.sent_at < history[index - 1].sent_at {
            return Err(AnalysisError::OutOfOrder { index });
        }
    }
    Ok(())
}
