//! In-memory handoff ledger and checkpoints.
//!
//! Records are sharded by conversation key so evaluations for different
//! conversations never contend. All mutations of one conversation's records
//! happen under that key's shard entry, which makes the pending check and
//! the append a single atomic step.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::store::{
    check_finalizable, completed_between, CheckpointStore, HandoffStore, StoreError, StoreResult,
};
use super::types::{ExecutionOutcome, HandoffId, HandoffRecord};
use crate::learner::OutcomeSample;
use crate::thresholds::ThresholdProfile;
use crate::types::{ConversationKey, Transition};

#[derive(Debug, Default)]
pub struct MemoryHandoffStore {
    records: DashMap<ConversationKey, Vec<HandoffRecord>>,
    index: DashMap<HandoffId, ConversationKey>,
}

impl MemoryHandoffStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl HandoffStore for MemoryHandoffStore {
    fn append(&self, record: &HandoffRecord) -> StoreResult<()> {
        match self.records.entry(record.conversation_key.clone()) {
            Entry::Occupied(mut entry) => {
                if record.is_pending() {
                    if let Some(existing) = entry.get().iter().find(|r| r.is_pending()) {
                        return Err(StoreError::PendingExists {
                            key: record.conversation_key.clone(),
                            existing: existing.id,
                        });
                    }
                }
                entry.get_mut().push(record.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![record.clone()]);
            }
        }
        self.index
            .insert(record.id, record.conversation_key.clone());
        Ok(())
    }

    fn get(&self, id: HandoffId) -> StoreResult<Option<HandoffRecord>> {
        let Some(key) = self.index.get(&id).map(|k| k.clone()) else {
            return Ok(None);
        };
        Ok(self
            .records
            .get(&key)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned()))
    }

    fn finalize(
        &self,
        id: HandoffId,
        expected_version: u64,
        outcome: ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> StoreResult<HandoffRecord> {
        let key = self
            .index
            .get(&id)
            .map(|k| k.clone())
            .ok_or(StoreError::NotFound(id))?;
        let mut records = self.records.get_mut(&key).ok_or(StoreError::NotFound(id))?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;

        check_finalizable(record, expected_version, &outcome)?;
        record.finalize(outcome, at);
        Ok(record.clone())
    }

    fn pending_for(&self, key: &ConversationKey) -> StoreResult<Option<HandoffRecord>> {
        Ok(self
            .records
            .get(key)
            .and_then(|records| records.iter().find(|r| r.is_pending()).cloned()))
    }

    fn records_for(&self, key: &ConversationKey) -> StoreResult<Vec<HandoffRecord>> {
        Ok(self
            .records
            .get(key)
            .map(|records| records.clone())
            .unwrap_or_default())
    }

    fn recent_completed(
        &self,
        key: &ConversationKey,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<HandoffRecord>> {
        Ok(self
            .records
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| completed_between(r, since, until))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<HandoffRecord>> {
        let mut stale: Vec<HandoffRecord> = self
            .records
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|r| r.is_pending() && r.decided_at <= cutoff)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        stale.sort_by_key(|r| r.decided_at);
        Ok(stale)
    }
}

/// Checkpoints kept in process memory; lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    thresholds: Mutex<BTreeMap<Transition, ThresholdProfile>>,
    outcomes: Mutex<Vec<OutcomeSample>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save_thresholds(&self, profiles: &[ThresholdProfile]) -> StoreResult<()> {
        let mut thresholds = self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        thresholds.clear();
        for profile in profiles {
            thresholds.insert(profile.transition, profile.clone());
        }
        Ok(())
    }

    fn load_thresholds(&self) -> StoreResult<Vec<ThresholdProfile>> {
        Ok(self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn append_outcome(&self, sample: &OutcomeSample) -> StoreResult<()> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*sample);
        Ok(())
    }

    fn load_outcomes(&self) -> StoreResult<Vec<OutcomeSample>> {
        Ok(self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::DecisionOutcome;
    use crate::types::{AgentType, Transition};
    use chrono::Duration;

    fn key() -> ConversationKey {
        ConversationKey::new("contact-42")
    }

    fn lead_to_buyer() -> Transition {
        Transition::new(AgentType::Lead, AgentType::Buyer)
    }

    #[test]
    fn test_append_and_get() {
        let store = MemoryHandoffStore::new();
        let record = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, Utc::now());
        store.append(&record).unwrap();
        assert_eq!(store.get(record.id).unwrap(), Some(record.clone()));
        assert_eq!(store.pending_for(&key()).unwrap(), Some(record));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_single_pending_per_conversation() {
        let store = MemoryHandoffStore::new();
        let first = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, Utc::now());
        store.append(&first).unwrap();

        let second = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, Utc::now());
        match store.append(&second) {
            Err(StoreError::PendingExists { existing, .. }) => assert_eq!(existing, first.id),
            other => panic!("expected PendingExists, got {other:?}"),
        }

        // Audit records are never blocked
        let audit = HandoffRecord::declined(
            key(),
            lead_to_buyer(),
            0.9,
            DecisionOutcome::Deferred,
            "in_flight",
            Utc::now(),
        );
        store.append(&audit).unwrap();
    }

    #[test]
    fn test_finalize_exactly_once() {
        let store = MemoryHandoffStore::new();
        let record = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, Utc::now());
        store.append(&record).unwrap();

        let done = store
            .finalize(record.id, 0, ExecutionOutcome::Completed, Utc::now())
            .unwrap();
        assert_eq!(done.version, 1);
        assert!(store.pending_for(&key()).unwrap().is_none());

        let again = store.finalize(record.id, 0, ExecutionOutcome::failed("late"), Utc::now());
        assert!(matches!(again, Err(StoreError::AlreadyFinalized(id)) if id == record.id));
        assert_eq!(
            store.get(record.id).unwrap().unwrap().execution_outcome,
            Some(ExecutionOutcome::Completed)
        );
    }

    #[test]
    fn test_finalize_rejects_pending_outcome() {
        let store = MemoryHandoffStore::new();
        let record = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, Utc::now());
        store.append(&record).unwrap();
        assert!(matches!(
            store.finalize(record.id, 0, ExecutionOutcome::Pending, Utc::now()),
            Err(StoreError::NonTerminalOutcome)
        ));
    }

    #[test]
    fn test_finalize_unknown_record() {
        let store = MemoryHandoffStore::new();
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            store.finalize(id, 0, ExecutionOutcome::Completed, Utc::now()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_was_recent_transition_blocks_both_directions() {
        let store = MemoryHandoffStore::new();
        let now = Utc::now();
        let record = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, now);
        store.append(&record).unwrap();
        store
            .finalize(record.id, 0, ExecutionOutcome::Completed, now)
            .unwrap();

        let window = Duration::minutes(30);
        let later = now + Duration::minutes(10);
        assert!(store
            .was_recent_transition(&key(), AgentType::Buyer, AgentType::Lead, window, later)
            .unwrap());
        assert!(store
            .was_recent_transition(&key(), AgentType::Lead, AgentType::Buyer, window, later)
            .unwrap());
        assert!(!store
            .was_recent_transition(&key(), AgentType::Buyer, AgentType::Seller, window, later)
            .unwrap());

        let expired = now + Duration::minutes(31);
        assert!(!store
            .was_recent_transition(&key(), AgentType::Buyer, AgentType::Lead, window, expired)
            .unwrap());
    }

    #[test]
    fn test_recent_completed_skips_audit_and_old_records() {
        let store = MemoryHandoffStore::new();
        let now = Utc::now();

        let old = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, now - Duration::hours(2));
        store.append(&old).unwrap();
        store
            .finalize(old.id, 0, ExecutionOutcome::Completed, now - Duration::hours(2))
            .unwrap();
        for _ in 0..50 {
            let audit = HandoffRecord::declined(
                key(),
                lead_to_buyer(),
                0.4,
                DecisionOutcome::Rejected,
                "low_confidence",
                now,
            );
            store.append(&audit).unwrap();
        }
        let fresh = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, now);
        store.append(&fresh).unwrap();
        store
            .finalize(fresh.id, 0, ExecutionOutcome::Completed, now)
            .unwrap();

        let recent = store
            .recent_completed(&key(), now - Duration::minutes(30), now)
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, fresh.id);
        assert_eq!(store.records_for(&key()).unwrap().len(), 52);
    }

    #[test]
    fn test_unbounded_window_does_not_overflow() {
        let store = MemoryHandoffStore::new();
        let now = Utc::now();
        let record = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, now);
        store.append(&record).unwrap();
        store
            .finalize(record.id, 0, ExecutionOutcome::Completed, now)
            .unwrap();
        assert!(store
            .was_recent_transition(
                &key(),
                AgentType::Buyer,
                AgentType::Lead,
                Duration::weeks(52 * 300_000),
                now
            )
            .unwrap());
    }

    #[test]
    fn test_failed_transfer_does_not_count_as_recent() {
        let store = MemoryHandoffStore::new();
        let now = Utc::now();
        let record = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, now);
        store.append(&record).unwrap();
        store
            .finalize(record.id, 0, ExecutionOutcome::failed("crm_down"), now)
            .unwrap();
        assert!(!store
            .was_recent_transition(
                &key(),
                AgentType::Buyer,
                AgentType::Lead,
                Duration::minutes(30),
                now
            )
            .unwrap());
    }

    #[test]
    fn test_stale_pending_cutoff() {
        let store = MemoryHandoffStore::new();
        let now = Utc::now();
        let old = HandoffRecord::approved(key(), lead_to_buyer(), 0.9, now - Duration::minutes(5));
        let fresh = HandoffRecord::approved(
            ConversationKey::new("contact-7"),
            lead_to_buyer(),
            0.9,
            now,
        );
        store.append(&old).unwrap();
        store.append(&fresh).unwrap();

        let stale = store.stale_pending(now - Duration::minutes(2)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }
}
