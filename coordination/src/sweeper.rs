//! Lease sweeper background task.
//!
//! Executions can stall: the runtime crashes mid-transfer, a worker is
//! killed, or an acknowledgement never arrives. The sweeper runs on a fixed
//! interval and
//!
//! - removes leases whose TTL has passed, and
//! - marks pending ledger records whose lease is gone as
//!   `Failed("execution_timeout")`.
//!
//! Finalization is a compare-and-set, so racing with a late acknowledgement
//! is harmless: whichever write lands first wins and the other is a no-op.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::analytics::HandoffAnalytics;
use crate::clock::SharedClock;
use crate::config::ConfigHandle;
use crate::events::{HandoffEvent, SharedEventBus};
use crate::lease::SharedLockManager;
use crate::state::{ExecutionOutcome, SharedHandoffStore, EXECUTION_TIMEOUT};

/// Cumulative sweeper counters.
#[derive(Debug, Default)]
pub struct SweeperMetrics {
    pub runs: AtomicU64,
    pub leases_reclaimed: AtomicU64,
    pub records_timed_out: AtomicU64,
    pub errors: AtomicU64,
}

impl SweeperMetrics {
    pub fn snapshot(&self) -> SweeperMetricsSnapshot {
        SweeperMetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            leases_reclaimed: self.leases_reclaimed.load(Ordering::Relaxed),
            records_timed_out: self.records_timed_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperMetricsSnapshot {
    pub runs: u64,
    pub leases_reclaimed: u64,
    pub records_timed_out: u64,
    pub errors: u64,
}

/// Result of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub leases_reclaimed: usize,
    pub records_timed_out: usize,
    pub errors: usize,
}

pub struct LeaseSweeper {
    locks: SharedLockManager,
    ledger: SharedHandoffStore,
    config: ConfigHandle,
    clock: SharedClock,
    events: SharedEventBus,
    analytics: Arc<HandoffAnalytics>,
    metrics: Arc<SweeperMetrics>,
}

impl LeaseSweeper {
    pub fn new(
        locks: SharedLockManager,
        ledger: SharedHandoffStore,
        config: ConfigHandle,
        clock: SharedClock,
        events: SharedEventBus,
        analytics: Arc<HandoffAnalytics>,
    ) -> Self {
        Self {
            locks,
            ledger,
            config,
            clock,
            events,
            analytics,
            metrics: Arc::new(SweeperMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<SweeperMetrics> {
        self.metrics.clone()
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for expired in self.locks.reclaim_expired(now) {
            info!(key = %expired.key, expired_at = %expired.expired_at, "Reclaimed expired lease");
            self.events.publish(HandoffEvent::LeaseReclaimed {
                conversation_key: expired.key,
                token: expired.token,
                timestamp: now,
            });
            report.leases_reclaimed += 1;
        }

        let cutoff = now - self.config.current().lock_ttl();
        match self.ledger.stale_pending(cutoff) {
            Ok(stale) => {
                for record in stale {
                    // Still covered by a live lease (e.g. TTL was raised since).
                    if self.locks.is_held(&record.conversation_key, now) {
                        continue;
                    }
                    let outcome = ExecutionOutcome::failed(EXECUTION_TIMEOUT);
                    match self
                        .ledger
                        .finalize(record.id, record.version, outcome.clone(), now)
                    {
                        Ok(_) => {
                            warn!(
                                record_id = %record.id,
                                key = %record.conversation_key,
                                transition = %record.transition(),
                                "Handoff execution timed out"
                            );
                            self.analytics.record_execution(&outcome, true);
                            self.events.publish(HandoffEvent::ExecutionFinalized {
                                record_id: record.id,
                                conversation_key: record.conversation_key,
                                outcome,
                                timestamp: now,
                            });
                            report.records_timed_out += 1;
                        }
                        Err(e) if e.is_conflict() => {
                            debug!(record_id = %record.id, "Record finalized before sweep");
                        }
                        Err(e) => {
                            warn!(record_id = %record.id, error = %e, "Failed to time out record");
                            report.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to list stale pending records");
                report.errors += 1;
            }
        }

        self.metrics.runs.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .leases_reclaimed
            .fetch_add(report.leases_reclaimed as u64, Ordering::Relaxed);
        self.metrics
            .records_timed_out
            .fetch_add(report.records_timed_out as u64, Ordering::Relaxed);
        self.metrics
            .errors
            .fetch_add(report.errors as u64, Ordering::Relaxed);
        report
    }

    /// Sweep on a fixed interval until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = period.as_secs(), "Starting lease sweeper");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report.leases_reclaimed > 0 || report.records_timed_out > 0 {
                        debug!(?report, "Sweep complete");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Lease sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for LeaseSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseSweeper")
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}
