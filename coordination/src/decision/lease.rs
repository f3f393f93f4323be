//! Execution lease handed out with every approval.
//!
//! An [`ExecutionLease`] owns the conversation lock for the duration of the
//! transfer. Finalizing it writes the terminal outcome to the ledger, then
//! releases the lock. Dropping it unfinalized does the same with
//! `Failed("abandoned")`, so a cancelled or panicking executor never strands
//! a conversation until the TTL runs out.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analytics::HandoffAnalytics;
use crate::clock::SharedClock;
use crate::events::{HandoffEvent, SharedEventBus};
use crate::lease::{LockHandle, SharedLockManager};
use crate::state::{
    ExecutionOutcome, HandoffId, HandoffRecord, SharedHandoffStore, StoreError, StoreResult,
    ABANDONED,
};

/// Everything needed to close out an approved handoff.
pub(crate) struct LeaseFinalizer {
    pub(crate) locks: SharedLockManager,
    pub(crate) ledger: SharedHandoffStore,
    pub(crate) events: SharedEventBus,
    pub(crate) analytics: Arc<HandoffAnalytics>,
    pub(crate) clock: SharedClock,
}

impl LeaseFinalizer {
    fn finish(
        &self,
        record_id: HandoffId,
        version: u64,
        handle: &LockHandle,
        outcome: ExecutionOutcome,
    ) -> StoreResult<HandoffRecord> {
        let now = self.clock.now();
        // Ledger first: the lock must not be free while the record is still pending.
        let result = self.ledger.finalize(record_id, version, outcome.clone(), now);
        self.locks.release(handle);

        match &result {
            Ok(record) => {
                self.analytics.record_execution(&outcome, false);
                self.events.publish(HandoffEvent::ExecutionFinalized {
                    record_id,
                    conversation_key: record.conversation_key.clone(),
                    outcome: outcome.clone(),
                    timestamp: now,
                });
                info!(
                    record_id = %record_id,
                    key = %record.conversation_key,
                    transition = %record.transition(),
                    %outcome,
                    "Handoff execution finalized"
                );
            }
            Err(e) if e.is_conflict() => {
                debug!(record_id = %record_id, error = %e, "Record already finalized elsewhere");
            }
            Err(e) => {
                warn!(record_id = %record_id, error = %e, "Failed to finalize handoff record");
            }
        }
        result
    }
}

/// Exclusive right to execute one approved handoff.
pub struct ExecutionLease {
    handle: Option<LockHandle>,
    expires_at: DateTime<Utc>,
    record_id: HandoffId,
    version: u64,
    finalizer: Arc<LeaseFinalizer>,
}

impl std::fmt::Debug for ExecutionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLease")
            .field("record_id", &self.record_id)
            .field("expires_at", &self.expires_at)
            .field("finalized", &self.handle.is_none())
            .finish()
    }
}

impl ExecutionLease {
    pub(crate) fn new(
        handle: LockHandle,
        record: &HandoffRecord,
        finalizer: Arc<LeaseFinalizer>,
    ) -> Self {
        Self {
            expires_at: handle.expires_at,
            handle: Some(handle),
            record_id: record.id,
            version: record.version,
            finalizer,
        }
    }

    pub fn record_id(&self) -> HandoffId {
        self.record_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Time left before the sweeper may reclaim this lease.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// The transfer happened.
    pub fn complete(self) -> StoreResult<HandoffRecord> {
        self.finish(ExecutionOutcome::Completed)
    }

    /// The transfer did not happen.
    pub fn fail(self, reason: impl Into<String>) -> StoreResult<HandoffRecord> {
        self.finish(ExecutionOutcome::failed(reason))
    }

    fn finish(mut self, outcome: ExecutionOutcome) -> StoreResult<HandoffRecord> {
        match self.handle.take() {
            Some(handle) => self
                .finalizer
                .finish(self.record_id, self.version, &handle, outcome),
            None => Err(StoreError::AlreadyFinalized(self.record_id)),
        }
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!(record_id = %self.record_id, key = %handle.key, "Execution lease dropped without a result");
            let _ = self.finalizer.finish(
                self.record_id,
                self.version,
                &handle,
                ExecutionOutcome::failed(ABANDONED),
            );
        }
    }
}
