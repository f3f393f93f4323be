//! Core identity types shared by every coordination component.
//!
//! Agents form a closed set: the platform runs exactly three specialized
//! conversational agents, so an [`AgentType`] is an enum rather than a
//! free-form string and every `(source, target)` pair is a [`Transition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Specialized conversational agent that can own a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Entry agent: qualifies and nurtures new contacts.
    Lead,
    /// Works with contacts who want to purchase.
    Buyer,
    /// Works with contacts who want to sell.
    Seller,
}

impl AgentType {
    /// Number of agent types.
    pub const COUNT: usize = 3;

    /// All agent types in a stable order.
    pub fn all() -> &'static [AgentType] {
        &[AgentType::Lead, AgentType::Buyer, AgentType::Seller]
    }

    /// Dense index in `0..COUNT`.
    pub fn index(self) -> usize {
        match self {
            AgentType::Lead => 0,
            AgentType::Buyer => 1,
            AgentType::Seller => 2,
        }
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Lead => "lead",
            AgentType::Buyer => "buyer",
            AgentType::Seller => "seller",
        }
    }

    /// Capitalized name used in CRM tags and reports.
    pub fn label(&self) -> &'static str {
        match self {
            AgentType::Lead => "Lead",
            AgentType::Buyer => "Buyer",
            AgentType::Seller => "Seller",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error when parsing an agent name that is not one of the known agents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown agent type: {0}")]
pub struct UnknownAgent(pub String);

impl FromStr for AgentType {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lead" => Ok(AgentType::Lead),
            "buyer" => Ok(AgentType::Buyer),
            "seller" => Ok(AgentType::Seller),
            _ => Err(UnknownAgent(s.to_string())),
        }
    }
}

/// Directed ownership transfer between two agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Transition {
    pub source: AgentType,
    pub target: AgentType,
}

impl Transition {
    pub fn new(source: AgentType, target: AgentType) -> Self {
        Self { source, target }
    }

    /// The same pair in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.target,
            target: self.source,
        }
    }

    /// Whether source and target are the same agent (never a valid handoff).
    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }

    /// Dense index in `0..AgentType::COUNT^2`.
    pub fn index(&self) -> usize {
        self.source.index() * AgentType::COUNT + self.target.index()
    }

    /// Every valid (non self-loop) transition.
    pub fn all() -> impl Iterator<Item = Transition> {
        AgentType::all().iter().flat_map(|&source| {
            AgentType::all()
                .iter()
                .filter(move |&&target| target != source)
                .map(move |&target| Transition::new(source, target))
        })
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

/// Stable identifier for one ongoing end-user conversation (one per contact).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blank keys are accepted by the constructor but rejected by the engine.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ConversationKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

/// A single transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            sent_at,
        }
    }

    pub fn agent(content: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
            sent_at,
        }
    }
}
