//! State persistence for handoff coordination
//!
//! Three kinds of state outlive a single evaluation:
//!
//! - the handoff ledger ([`HandoffStore`]), an append-only record of every
//!   decision and its execution outcome
//! - per-conversation rate-limit counters
//!   ([`RateLimitStore`](crate::rate_limit::RateLimitStore))
//! - learner checkpoints ([`CheckpointStore`]): calibrated thresholds and
//!   the outcome log
//!
//! In-memory implementations are always available. With the `heavy-state`
//! feature, [`RocksStateStore`] implements all three on one RocksDB instance
//! using column families:
//!
//! - `records` / `record_index` / `pending`: the ledger
//! - `rate_limits`: window counters
//! - `thresholds` / `outcomes`: learner checkpoints
//!
//! # Usage
//!
//! ```ignore
//! use handoff_coordination::state::{HandoffStore, RocksStateStore};
//!
//! let store = RocksStateStore::open("./handoff-state")?.shared();
//! let pending = store.pending_for(&"contact-42".into())?;
//! ```

pub mod memory;
#[cfg(feature = "heavy-state")]
pub mod rocks;
#[cfg(feature = "heavy-state")]
pub mod schema;
pub mod store;
pub mod types;

pub use memory::{MemoryCheckpointStore, MemoryHandoffStore};
#[cfg(feature = "heavy-state")]
pub use rocks::{RocksStateStore, SharedRocksStateStore};
pub use store::{
    CheckpointStore, HandoffStore, SharedCheckpointStore, SharedHandoffStore, StoreError,
    StoreResult,
};
pub use types::{
    DecisionOutcome, ExecutionOutcome, HandoffId, HandoffRecord, ABANDONED, EXECUTION_TIMEOUT,
};
