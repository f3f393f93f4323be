//! Handoff analytics counters.
//!
//! Lock-free counters bumped on every decision and every finalized
//! execution, exposed as a serializable [`AnalyticsSnapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::decision::DecisionReason;
use crate::state::ExecutionOutcome;

#[derive(Debug, Default)]
pub struct HandoffAnalytics {
    evaluations: AtomicU64,
    approved: AtomicU64,
    below_confidence: AtomicU64,
    rate_limited: AtomicU64,
    circular: AtomicU64,
    target_degraded: AtomicU64,
    in_flight: AtomicU64,
    persistence_unavailable: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub evaluations: u64,
    pub approved: u64,
    pub blocked_by_confidence: u64,
    pub blocked_by_rate_limit: u64,
    pub blocked_by_circular: u64,
    pub deferred_degraded: u64,
    pub deferred_in_flight: u64,
    pub persistence_unavailable: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    /// Subset of `executions_failed` finalized by the sweeper
    pub executions_timed_out: u64,
}

impl AnalyticsSnapshot {
    /// Fraction of finalized executions that completed, `None` before any finished.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.executions_completed + self.executions_failed;
        (total > 0).then(|| self.executions_completed as f64 / total as f64)
    }

    pub fn approval_rate(&self) -> Option<f64> {
        (self.evaluations > 0).then(|| self.approved as f64 / self.evaluations as f64)
    }
}

impl HandoffAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_approved(&self) {
        self.approved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_declined(&self, reason: DecisionReason) {
        let counter = match reason {
            DecisionReason::BelowConfidence => &self.below_confidence,
            DecisionReason::RateLimited => &self.rate_limited,
            DecisionReason::Circular => &self.circular,
            DecisionReason::TargetDegraded => &self.target_degraded,
            DecisionReason::InFlight => &self.in_flight,
            DecisionReason::PersistenceUnavailable => &self.persistence_unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execution(&self, outcome: &ExecutionOutcome, timed_out: bool) {
        match outcome {
            ExecutionOutcome::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            ExecutionOutcome::Failed { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if timed_out {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                }
            }
            ExecutionOutcome::Pending => {}
        }
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            approved: self.approved.load(Ordering::Relaxed),
            blocked_by_confidence: self.below_confidence.load(Ordering::Relaxed),
            blocked_by_rate_limit: self.rate_limited.load(Ordering::Relaxed),
            blocked_by_circular: self.circular.load(Ordering::Relaxed),
            deferred_degraded: self.target_degraded.load(Ordering::Relaxed),
            deferred_in_flight: self.in_flight.load(Ordering::Relaxed),
            persistence_unavailable: self.persistence_unavailable.load(Ordering::Relaxed),
            executions_completed: self.completed.load(Ordering::Relaxed),
            executions_failed: self.failed.load(Ordering::Relaxed),
            executions_timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let analytics = HandoffAnalytics::new();
        analytics.record_evaluation();
        analytics.record_evaluation();
        analytics.record_approved();
        analytics.record_declined(DecisionReason::Circular);
        analytics.record_execution(&ExecutionOutcome::Completed, false);
        analytics.record_execution(&ExecutionOutcome::failed("execution_timeout"), true);

        let snapshot = analytics.snapshot();
        assert_eq!(snapshot.evaluations, 2);
        assert_eq!(snapshot.blocked_by_circular, 1);
        assert_eq!(snapshot.executions_timed_out, 1);
        assert_eq!(snapshot.success_rate(), Some(0.5));
        assert_eq!(snapshot.approval_rate(), Some(0.5));
    }

    #[test]
    fn test_empty_rates() {
        let snapshot = HandoffAnalytics::new().snapshot();
        assert_eq!(snapshot.success_rate(), None);
        assert_eq!(snapshot.approval_rate(), None);
    }
}
