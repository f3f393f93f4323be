//! Cross-agent handoff coordination
//!
//! Decides whether a conversation owned by one specialized agent should be
//! transferred to another, and makes sure each approved transfer executes
//! exactly once.
//!
//! # Components
//!
//! - [`intent`]: transcript analysis into an [`IntentProfile`]
//! - [`performance`]: rolling latency and error-rate snapshots per agent
//! - [`rate_limit`] and [`lease`]: per-conversation caps and the execution lock
//! - [`thresholds`]: per-transition confidence thresholds
//! - [`decision`]: the gate sequence producing Approved / Deferred / Rejected
//! - [`executor`]: runs an [`AgentTransfer`] under the lease and finalizes
//! - [`learner`]: outcome log and threshold recalibration
//! - [`sweeper`]: reclaims expired leases and times out stalled executions
//! - [`state`]: the handoff ledger and checkpoints (in-memory, RocksDB with
//!   `heavy-state`)
//! - [`events`]: broadcast of coordination events
//! - [`coordinator`]: facade wiring everything from one config
//!
//! # Usage
//!
//! ```ignore
//! use handoff_coordination::{AgentType, ConversationKey, CoordinationConfig, HandoffCoordinator};
//!
//! let coordinator = HandoffCoordinator::in_memory(CoordinationConfig::from_env())?;
//! let key = ConversationKey::new("contact-42");
//!
//! match coordinator.evaluate_history(&key, AgentType::Lead, &history, AgentType::Buyer)? {
//!     Decision::Approved(approved) => {
//!         coordinator.execute(approved, crm_transfer).await?;
//!     }
//!     other => tracing::info!(reason = other.reason(), "Handoff not approved"),
//! }
//! ```

pub mod analytics;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod events;
pub mod executor;
pub mod intent;
pub mod learner;
pub mod lease;
pub mod performance;
pub mod rate_limit;
pub mod state;
pub mod sweeper;
pub mod thresholds;
pub mod types;

// Re-export core types
pub use types::{AgentType, ConversationKey, Message, Role, Transition, UnknownAgent};

// Re-export configuration types
pub use config::{ColdStartPolicy, ConfigError, ConfigHandle, CoordinationConfig, SlaTargets};

// Re-export coordinator types
pub use coordinator::{
    BackgroundTasks, CoordinatorError, CoordinatorResult, HandoffCoordinator,
    HandoffCoordinatorBuilder,
};

// Re-export decision types
pub use decision::{
    ApprovedHandoff, Decision, DecisionReason, DecisionSummary, EngineError, ExecutionLease,
    ExecutionRequest, HandoffDecisionEngine,
};

// Re-export execution types
pub use executor::{AgentTransfer, HandoffExecutor, TransferError};

// Re-export intent types
pub use intent::{AnalysisError, IntentAnalyzer, IntentProfile, PatternAnalyzer};

// Re-export learner types
pub use learner::{CalibrationReport, OutcomeRecorder, OutcomeResult, OutcomeSample};

// Re-export state types
pub use state::{
    CheckpointStore, DecisionOutcome, ExecutionOutcome, HandoffId, HandoffRecord, HandoffStore,
    StoreError, StoreResult,
};

// Re-export observation types
pub use analytics::AnalyticsSnapshot;
pub use events::{EventBus, EventFilter, HandoffEvent, SharedEventBus};
pub use thresholds::{ThresholdProfile, ThresholdStore};
