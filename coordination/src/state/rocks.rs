//! RocksDB-backed state store
//!
//! One database holds the handoff ledger, the rate-limit counters and the
//! learner checkpoints, each in its own column family (see
//! [`schema`](super::schema)). Values are JSON.
//!
//! Reads share the database lock. Every read-modify-write (append with the
//! pending check, finalize, rate-limit check-and-increment) runs under the
//! exclusive lock and commits through a single `WriteBatch`, which gives the
//! same single-key atomicity as the in-memory stores.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::schema::{self, keys, ALL_CFS};
use super::store::{
    check_finalizable, completed_between, CheckpointStore, HandoffStore, StoreError, StoreResult,
};
use super::types::{ExecutionOutcome, HandoffId, HandoffRecord};
use crate::learner::OutcomeSample;
use crate::rate_limit::{RateCaps, RateLimitOutcome, RateLimitState, RateLimitStore, RatePermit};
use crate::thresholds::ThresholdProfile;
use crate::types::ConversationKey;

/// Shared reference to RocksStateStore
pub type SharedRocksStateStore = Arc<RocksStateStore>;

/// RocksDB-backed persistent state store
pub struct RocksStateStore {
    db: RwLock<DB>,
    path: PathBuf,
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn cf<'a>(db: &'a DB, name: &str) -> StoreResult<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::ColumnFamilyNotFound(name.to_string()))
}

fn read<T: DeserializeOwned>(db: &DB, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
    let cf = cf(db, cf_name)?;
    match db.get_cf(&cf, key.as_bytes())? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn read_string(db: &DB, cf_name: &str, key: &str) -> StoreResult<Option<String>> {
    let cf = cf(db, cf_name)?;
    match db.get_cf(&cf, key.as_bytes())? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(e.to_string())),
        None => Ok(None),
    }
}

/// Every value in a column family, in key order.
fn scan<T: DeserializeOwned>(db: &DB, cf_name: &str) -> StoreResult<Vec<T>> {
    let cf = cf(db, cf_name)?;
    let mut values = Vec::new();
    for result in db.iterator_cf(&cf, IteratorMode::Start) {
        let (_, value) = result?;
        values.push(decode(&value)?);
    }
    Ok(values)
}

/// Load a record through its id index.
fn record_by_id(db: &DB, id: HandoffId) -> StoreResult<Option<(String, HandoffRecord)>> {
    let index_key = keys::record_index(&id.to_string());
    let Some(record_key) = read_string(db, schema::CF_RECORD_INDEX, &index_key)? else {
        return Ok(None);
    };
    Ok(read(db, schema::CF_RECORDS, &record_key)?.map(|record| (record_key, record)))
}

fn pending_record(db: &DB, key: &ConversationKey) -> StoreResult<Option<HandoffRecord>> {
    let pending_key = keys::pending(key.as_str());
    let Some(record_key) = read_string(db, schema::CF_PENDING, &pending_key)? else {
        return Ok(None);
    };
    Ok(read::<HandoffRecord>(db, schema::CF_RECORDS, &record_key)?.filter(|r| r.is_pending()))
}

impl RocksStateStore {
    /// Open or create a state store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedRocksStateStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl std::fmt::Debug for RocksStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Ledger
// =============================================================================

impl HandoffStore for RocksStateStore {
    fn append(&self, record: &HandoffRecord) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let conversation = record.conversation_key.as_str();

        if record.is_pending() {
            if let Some(existing) = pending_record(&db, &record.conversation_key)? {
                return Err(StoreError::PendingExists {
                    key: record.conversation_key.clone(),
                    existing: existing.id,
                });
            }
        }

        let id = record.id.to_string();
        let record_key = keys::record(conversation, record.decided_at, &id);
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf(&db, schema::CF_RECORDS)?,
            record_key.as_bytes(),
            encode(record)?,
        );
        batch.put_cf(
            &cf(&db, schema::CF_RECORD_INDEX)?,
            keys::record_index(&id).as_bytes(),
            record_key.as_bytes(),
        );
        if record.is_pending() {
            batch.put_cf(
                &cf(&db, schema::CF_PENDING)?,
                keys::pending(conversation).as_bytes(),
                record_key.as_bytes(),
            );
        }
        db.write(batch)?;
        Ok(())
    }

    fn get(&self, id: HandoffId) -> StoreResult<Option<HandoffRecord>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(record_by_id(&db, id)?.map(|(_, record)| record))
    }

    fn finalize(
        &self,
        id: HandoffId,
        expected_version: u64,
        outcome: ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> StoreResult<HandoffRecord> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let (record_key, mut record) = record_by_id(&db, id)?.ok_or(StoreError::NotFound(id))?;

        check_finalizable(&record, expected_version, &outcome)?;
        record.finalize(outcome, at);

        let pending_key = keys::pending(record.conversation_key.as_str());
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf(&db, schema::CF_RECORDS)?,
            record_key.as_bytes(),
            encode(&record)?,
        );
        if read_string(&db, schema::CF_PENDING, &pending_key)?.as_deref() == Some(record_key.as_str()) {
            batch.delete_cf(&cf(&db, schema::CF_PENDING)?, pending_key.as_bytes());
        }
        db.write(batch)?;
        Ok(record)
    }

    fn pending_for(&self, key: &ConversationKey) -> StoreResult<Option<HandoffRecord>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        pending_record(&db, key)
    }

    fn records_for(&self, key: &ConversationKey) -> StoreResult<Vec<HandoffRecord>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = cf(&db, schema::CF_RECORDS)?;
        let prefix = keys::conversation_prefix(key.as_str());

        let mut records = Vec::new();
        for result in db.prefix_iterator_cf(&cf, prefix.as_bytes()) {
            let (record_key, value) = result?;
            if !record_key.starts_with(prefix.as_bytes()) {
                break; // Prefix no longer matches
            }
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    fn recent_completed(
        &self,
        key: &ConversationKey,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<HandoffRecord>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = cf(&db, schema::CF_RECORDS)?;
        let prefix = keys::conversation_prefix(key.as_str());

        // Only matching records are kept; audit entries are decoded and dropped
        let mut recent = Vec::new();
        for result in db.prefix_iterator_cf(&cf, prefix.as_bytes()) {
            let (record_key, value) = result?;
            if !record_key.starts_with(prefix.as_bytes()) {
                break;
            }
            let record: HandoffRecord = decode(&value)?;
            if completed_between(&record, since, until) {
                recent.push(record);
            }
        }
        Ok(recent)
    }

    fn stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<HandoffRecord>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let pending_cf = cf(&db, schema::CF_PENDING)?;

        let mut stale = Vec::new();
        for result in db.iterator_cf(&pending_cf, IteratorMode::Start) {
            let (_, record_key) = result?;
            let record_key = String::from_utf8(record_key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            if let Some(record) = read::<HandoffRecord>(&db, schema::CF_RECORDS, &record_key)? {
                if record.is_pending() && record.decided_at <= cutoff {
                    stale.push(record);
                }
            }
        }
        stale.sort_by_key(|r| r.decided_at);
        Ok(stale)
    }
}

// =============================================================================
// Rate limits
// =============================================================================

impl RateLimitStore for RocksStateStore {
    fn check_and_increment(
        &self,
        key: &ConversationKey,
        caps: RateCaps,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitOutcome> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let state_key = keys::rate_limit(key.as_str());
        let mut state = read::<RateLimitState>(&db, schema::CF_RATE_LIMITS, &state_key)?
            .unwrap_or_else(|| RateLimitState::new(now));

        let outcome = state.try_take(key, caps, now);
        db.put_cf(
            &cf(&db, schema::CF_RATE_LIMITS)?,
            state_key.as_bytes(),
            encode(&state)?,
        )?;
        Ok(outcome)
    }

    fn refund(&self, permit: &RatePermit) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let state_key = keys::rate_limit(permit.key.as_str());
        if let Some(mut state) = read::<RateLimitState>(&db, schema::CF_RATE_LIMITS, &state_key)? {
            state.refund(permit);
            db.put_cf(
                &cf(&db, schema::CF_RATE_LIMITS)?,
                state_key.as_bytes(),
                encode(&state)?,
            )?;
        }
        Ok(())
    }

    fn state(&self, key: &ConversationKey) -> StoreResult<Option<RateLimitState>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        read(&db, schema::CF_RATE_LIMITS, &keys::rate_limit(key.as_str()))
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

impl CheckpointStore for RocksStateStore {
    fn save_thresholds(&self, profiles: &[ThresholdProfile]) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let cf = cf(&db, schema::CF_THRESHOLDS)?;

        let mut batch = WriteBatch::default();
        for result in db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = result?;
            batch.delete_cf(&cf, key);
        }
        for profile in profiles {
            batch.put_cf(
                &cf,
                keys::threshold(profile.transition).as_bytes(),
                encode(profile)?,
            );
        }
        db.write(batch)?;
        Ok(())
    }

    fn load_thresholds(&self) -> StoreResult<Vec<ThresholdProfile>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        scan(&db, schema::CF_THRESHOLDS)
    }

    fn append_outcome(&self, sample: &OutcomeSample) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let key = keys::outcome(
            sample.transition,
            sample.recorded_at,
            &Uuid::new_v4().to_string(),
        );
        db.put_cf(&cf(&db, schema::CF_OUTCOMES)?, key.as_bytes(), encode(sample)?)?;
        Ok(())
    }

    fn load_outcomes(&self) -> StoreResult<Vec<OutcomeSample>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut outcomes: Vec<OutcomeSample> = scan(&db, schema::CF_OUTCOMES)?;
        outcomes.sort_by_key(|o| o.recorded_at);
        Ok(outcomes)
    }
}
