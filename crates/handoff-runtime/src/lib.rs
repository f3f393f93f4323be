//! Runtime side of handoff coordination.
//!
//! The coordination crate decides and guards handoffs; this crate performs
//! them. [`crm::CrmTagTransfer`] applies the CRM tag swap for an approved
//! handoff and [`script::Simulation`] replays recorded traffic through a
//! coordinator for tuning caps and thresholds offline.

pub mod crm;
pub mod script;
pub mod startup;

pub use crm::{
    AgentTags, ContactStore, ContactStoreError, CrmTagTransfer, MemoryContactStore, TagAction,
};
pub use script::{parse_script, ScriptError, ScriptStep, Simulation, SimulationSummary, StepReport};
pub use startup::build_coordinator;
