//! Handoff ledger storage contract
//!
//! The ledger is append-only: records are written once at decision time and
//! the only mutation allowed afterwards is a single compare-and-set from
//! `Pending` to a terminal execution outcome.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::types::{ExecutionOutcome, HandoffId, HandoffRecord};
use crate::learner::OutcomeSample;
use crate::thresholds::ThresholdProfile;
use crate::types::{AgentType, ConversationKey};

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "heavy-state")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Record not found: {0}")]
    NotFound(HandoffId),

    #[error("Record {0} is already finalized")]
    AlreadyFinalized(HandoffId),

    #[error("Record {id} changed concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        id: HandoffId,
        expected: u64,
        found: u64,
    },

    #[error("Conversation {key} already has pending handoff {existing}")]
    PendingExists {
        key: ConversationKey,
        existing: HandoffId,
    },

    #[error("Execution outcome must be terminal")]
    NonTerminalOutcome,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

impl StoreError {
    /// Lost a race that someone else already resolved; not a fault.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyFinalized(_) | StoreError::VersionConflict { .. }
        )
    }
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a handoff ledger
pub type SharedHandoffStore = Arc<dyn HandoffStore>;

/// Durable ledger of handoff decisions.
pub trait HandoffStore: Send + Sync {
    /// Append a new record. Fails with [`StoreError::PendingExists`] when the
    /// record is pending and the conversation already has a pending record.
    fn append(&self, record: &HandoffRecord) -> StoreResult<()>;

    fn get(&self, id: HandoffId) -> StoreResult<Option<HandoffRecord>>;

    /// Move a pending record to a terminal outcome if its version still
    /// matches `expected_version`. Returns the finalized record.
    fn finalize(
        &self,
        id: HandoffId,
        expected_version: u64,
        outcome: ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> StoreResult<HandoffRecord>;

    /// The pending record for a conversation, if any.
    fn pending_for(&self, key: &ConversationKey) -> StoreResult<Option<HandoffRecord>>;

    /// All records of a conversation in decision order.
    fn records_for(&self, key: &ConversationKey) -> StoreResult<Vec<HandoffRecord>>;

    /// Pending records decided at or before `cutoff`.
    fn stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<HandoffRecord>>;

    /// Completed records of a conversation whose completion falls within
    /// `[since, until]`, in decision order.
    fn recent_completed(
        &self,
        key: &ConversationKey,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<HandoffRecord>> {
        Ok(self
            .records_for(key)?
            .into_iter()
            .filter(|record| completed_between(record, since, until))
            .collect())
    }

    /// Whether `source -> target` or `target -> source` completed for this
    /// conversation within `within` of `now`.
    ///
    /// Blocking the reverse direction prevents ping-pong; blocking the same
    /// direction prevents a transfer being replayed.
    fn was_recent_transition(
        &self,
        key: &ConversationKey,
        source: AgentType,
        target: AgentType,
        within: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let since = now
            .checked_sub_signed(within)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(self.recent_completed(key, since, now)?.iter().any(|record| {
            let pair = (record.source_agent, record.target_agent);
            pair == (source, target) || pair == (target, source)
        }))
    }
}

pub(crate) fn completed_between(
    record: &HandoffRecord,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> bool {
    record
        .completed_at()
        .is_some_and(|at| at >= since && at <= until)
}

/// Shared reference to a checkpoint store
pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

/// Learned state that should survive a restart: calibrated thresholds and
/// the outcome log they were calibrated from.
pub trait CheckpointStore: Send + Sync {
    /// Replace the stored threshold profiles.
    fn save_thresholds(&self, profiles: &[ThresholdProfile]) -> StoreResult<()>;

    fn load_thresholds(&self) -> StoreResult<Vec<ThresholdProfile>>;

    fn append_outcome(&self, sample: &OutcomeSample) -> StoreResult<()>;

    /// All logged outcomes, oldest first.
    fn load_outcomes(&self) -> StoreResult<Vec<OutcomeSample>>;
}

/// Shared precondition check for [`HandoffStore::finalize`] implementations.
pub(crate) fn check_finalizable(
    record: &HandoffRecord,
    expected_version: u64,
    outcome: &ExecutionOutcome,
) -> StoreResult<()> {
    if !outcome.is_terminal() {
        return Err(StoreError::NonTerminalOutcome);
    }
    if !record.is_pending() {
        return Err(StoreError::AlreadyFinalized(record.id));
    }
    if record.version != expected_version {
        return Err(StoreError::VersionConflict {
            id: record.id,
            expected: expected_version,
            found: record.version,
        });
    }
    Ok(())
}
