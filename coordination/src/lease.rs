//! Per-conversation mutual exclusion with time-bounded leases.
//!
//! At most one live lease exists per conversation key. A lease that outlives
//! its TTL is considered abandoned: the next acquirer takes it over, and the
//! sweeper removes it proactively. Release is token-checked, so a stale
//! holder can never release a lease that has since been granted to someone
//! else.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::types::ConversationKey;

/// Proof of holding a conversation's lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    pub key: ConversationKey,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before the lease lapses (zero if already expired).
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired(LockHandle),
    AlreadyLocked { held_until: DateTime<Utc> },
}

/// A lease removed by [`LockManager::reclaim_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLease {
    pub key: ConversationKey,
    pub token: Uuid,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// In-process lease table.
#[derive(Debug, Default)]
pub struct LockManager {
    leases: DashMap<ConversationKey, Lease>,
}

pub type SharedLockManager = Arc<LockManager>;

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedLockManager {
        Arc::new(self)
    }

    /// Acquire the lease for `key` unless a live lease exists.
    pub fn try_acquire(
        &self,
        key: &ConversationKey,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> LockAcquisition {
        let grant = || Lease {
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        };

        let lease = match self.leases.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expired(now) {
                    return LockAcquisition::AlreadyLocked {
                        held_until: entry.get().expires_at,
                    };
                }
                debug!(key = %key, "Taking over expired lease");
                let lease = grant();
                entry.insert(lease.clone());
                lease
            }
            Entry::Vacant(entry) => {
                let lease = grant();
                entry.insert(lease.clone());
                lease
            }
        };

        LockAcquisition::Acquired(LockHandle {
            key: key.clone(),
            token: lease.token,
            acquired_at: now,
            expires_at: lease.expires_at,
        })
    }

    /// Release a lease. Idempotent; returns whether this call removed it.
    pub fn release(&self, handle: &LockHandle) -> bool {
        self.leases
            .remove_if(&handle.key, |_, lease| lease.token == handle.token)
            .is_some()
    }

    pub fn is_held(&self, key: &ConversationKey, now: DateTime<Utc>) -> bool {
        self.leases
            .get(key)
            .is_some_and(|lease| !lease.is_expired(now))
    }

    /// Remove every lease whose TTL has passed.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Vec<ExpiredLease> {
        let candidates: Vec<ConversationKey> = self
            .leases
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|key| {
                self.leases
                    .remove_if(&key, |_, lease| lease.is_expired(now))
                    .map(|(key, lease)| ExpiredLease {
                        key,
                        token: lease.token,
                        expired_at: lease.expires_at,
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
