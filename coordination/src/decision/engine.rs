//! Handoff Decision Engine
//!
//! Runs the gates in a fixed order and stops at the first that fails:
//!
//! 1. confidence against the transition threshold
//! 2. per-conversation rate limit (check-and-increment)
//! 3. cycle prevention against recently completed handoffs
//! 4. target agent health
//! 5. per-conversation lease
//! 6. pending ledger record
//!
//! Gates after the rate limit refund the slot they took when they decline,
//! so only approved handoffs count against a conversation's caps. Every
//! decision, approved or not, is written to the ledger and published on
//! the event bus.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::lease::{ExecutionLease, LeaseFinalizer};
use super::types::{ApprovedHandoff, Decision, DecisionReason, EngineError};
use crate::analytics::HandoffAnalytics;
use crate::clock::SharedClock;
use crate::config::{ConfigHandle, CoordinationConfig};
use crate::events::{HandoffEvent, SharedEventBus};
use crate::intent::IntentProfile;
use crate::lease::{LockAcquisition, LockHandle, SharedLockManager};
use crate::performance::AgentPerformanceMonitor;
use crate::rate_limit::{RateCaps, RateLimitOutcome, RatePermit, SharedRateLimitStore};
use crate::state::{
    DecisionOutcome, ExecutionOutcome, HandoffId, HandoffRecord, SharedHandoffStore, StoreResult,
    EXECUTION_TIMEOUT,
};
use crate::thresholds::ThresholdStore;
use crate::types::{AgentType, ConversationKey, Transition};

/// Components the engine coordinates.
#[derive(Clone)]
pub struct EngineParts {
    pub config: ConfigHandle,
    pub clock: SharedClock,
    pub thresholds: Arc<ThresholdStore>,
    pub rate_limits: SharedRateLimitStore,
    pub locks: SharedLockManager,
    pub performance: Arc<AgentPerformanceMonitor>,
    pub ledger: SharedHandoffStore,
    pub events: SharedEventBus,
    pub analytics: Arc<HandoffAnalytics>,
}

pub struct HandoffDecisionEngine {
    parts: EngineParts,
    finalizer: Arc<LeaseFinalizer>,
}

/// Request-scoped values shared by the gate helpers.
struct Evaluation<'a> {
    key: &'a ConversationKey,
    transition: Transition,
    confidence: f64,
    now: DateTime<Utc>,
}

impl HandoffDecisionEngine {
    pub fn new(parts: EngineParts) -> Self {
        let finalizer = Arc::new(LeaseFinalizer {
            locks: parts.locks.clone(),
            ledger: parts.ledger.clone(),
            events: parts.events.clone(),
            analytics: parts.analytics.clone(),
            clock: parts.clock.clone(),
        });
        Self { parts, finalizer }
    }

    /// Decide whether `source` may hand the conversation to `target`.
    ///
    /// Returns `Err` only for malformed requests. Every operational outcome,
    /// including storage failures, is a [`Decision`].
    pub fn evaluate(
        &self,
        key: &ConversationKey,
        source: AgentType,
        profile: &IntentProfile,
        target: AgentType,
    ) -> Result<Decision, EngineError> {
        if key.is_blank() {
            return Err(EngineError::EmptyKey);
        }
        if source == target {
            return Err(EngineError::SelfTransition(source));
        }
        profile.validate()?;

        let config = self.parts.config.current();
        let eval = Evaluation {
            key,
            transition: Transition::new(source, target),
            confidence: profile.confidence_for(target),
            now: self.parts.clock.now(),
        };
        self.parts.analytics.record_evaluation();

        let threshold = self.parts.thresholds.get_threshold(eval.transition);
        if eval.confidence < threshold {
            debug!(
                key = %key,
                transition = %eval.transition,
                confidence = eval.confidence,
                threshold,
                "Confidence below threshold"
            );
            return Ok(self.reject(&eval, DecisionReason::BelowConfidence));
        }

        let caps = RateCaps {
            hourly: config.hourly_cap,
            daily: config.daily_cap,
        };
        let permit = match self.parts.rate_limits.check_and_increment(key, caps, eval.now) {
            Ok(RateLimitOutcome::Allowed(permit)) => permit,
            Ok(RateLimitOutcome::Limited { window, retry_at }) => {
                info!(key = %key, %window, %retry_at, "Handoff rate limited");
                return Ok(self.reject(&eval, DecisionReason::RateLimited));
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Rate-limit store unavailable");
                return Ok(self.reject(&eval, DecisionReason::PersistenceUnavailable));
            }
        };

        if let Some(reason) = self.circular_check(&eval, &config) {
            self.refund(&permit);
            return Ok(self.reject(&eval, reason));
        }

        let sla = config.sla_target_ms(target);
        if self.parts.performance.is_degraded(target, sla) {
            self.refund(&permit);
            info!(key = %key, %target, sla_ms = sla, "Target agent degraded, deferring");
            return Ok(self.defer(&eval, DecisionReason::TargetDegraded, config.backoff()));
        }

        let handle = match self.parts.locks.try_acquire(key, config.lock_ttl(), eval.now) {
            LockAcquisition::Acquired(handle) => handle,
            LockAcquisition::AlreadyLocked { held_until } => {
                self.refund(&permit);
                let retry_after = (held_until - eval.now).max(Duration::zero());
                return Ok(self.defer(&eval, DecisionReason::InFlight, retry_after));
            }
        };

        // A transfer may have completed between the first check and the lock.
        if let Some(reason) = self.circular_check(&eval, &config) {
            self.parts.locks.release(&handle);
            self.refund(&permit);
            return Ok(self.reject(&eval, reason));
        }

        match self.write_pending(&eval) {
            Ok(record) => Ok(self.approve(record, handle)),
            Err(e) => {
                self.parts.locks.release(&handle);
                self.refund(&permit);
                warn!(key = %key, error = %e, "Failed to write pending handoff record");
                Ok(self.reject(&eval, DecisionReason::PersistenceUnavailable))
            }
        }
    }

    /// `Some(reason)` when the transition must be blocked as circular.
    fn circular_check(
        &self,
        eval: &Evaluation<'_>,
        config: &CoordinationConfig,
    ) -> Option<DecisionReason> {
        match self.parts.ledger.was_recent_transition(
            eval.key,
            eval.transition.source,
            eval.transition.target,
            config.circular_window(),
            eval.now,
        ) {
            Ok(false) => None,
            Ok(true) => {
                info!(key = %eval.key, transition = %eval.transition, "Circular handoff blocked");
                Some(DecisionReason::Circular)
            }
            Err(e) => {
                warn!(key = %eval.key, error = %e, "Ledger unavailable for cycle check");
                Some(DecisionReason::PersistenceUnavailable)
            }
        }
    }

    /// Append the pending record, first timing out a pending record left
    /// behind by an execution whose lease has already lapsed.
    fn write_pending(&self, eval: &Evaluation<'_>) -> StoreResult<HandoffRecord> {
        if let Some(stale) = self.parts.ledger.pending_for(eval.key)? {
            match self.parts.ledger.finalize(
                stale.id,
                stale.version,
                ExecutionOutcome::failed(EXECUTION_TIMEOUT),
                eval.now,
            ) {
                Ok(_) => {
                    self.parts
                        .analytics
                        .record_execution(&ExecutionOutcome::failed(EXECUTION_TIMEOUT), true);
                    self.parts.events.publish(HandoffEvent::ExecutionFinalized {
                        record_id: stale.id,
                        conversation_key: stale.conversation_key.clone(),
                        outcome: ExecutionOutcome::failed(EXECUTION_TIMEOUT),
                        timestamp: eval.now,
                    });
                    info!(record_id = %stale.id, key = %eval.key, "Timed out stale pending handoff");
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }

        let record =
            HandoffRecord::approved(eval.key.clone(), eval.transition, eval.confidence, eval.now);
        self.parts.ledger.append(&record)?;
        Ok(record)
    }

    fn approve(&self, record: HandoffRecord, handle: LockHandle) -> Decision {
        self.parts.analytics.record_approved();
        self.parts.events.publish(HandoffEvent::DecisionMade {
            record_id: Some(record.id),
            conversation_key: record.conversation_key.clone(),
            source: record.source_agent,
            target: record.target_agent,
            confidence: record.confidence,
            outcome: DecisionOutcome::Approved,
            reason: "approved".to_string(),
            timestamp: record.decided_at,
        });
        info!(
            record_id = %record.id,
            key = %record.conversation_key,
            transition = %record.transition(),
            confidence = record.confidence,
            "Handoff approved"
        );
        let lease = ExecutionLease::new(handle, &record, self.finalizer.clone());
        Decision::Approved(ApprovedHandoff { record, lease })
    }

    fn reject(&self, eval: &Evaluation<'_>, reason: DecisionReason) -> Decision {
        let record_id = self.audit(eval, DecisionOutcome::Rejected, reason);
        Decision::Rejected { reason, record_id }
    }

    fn defer(&self, eval: &Evaluation<'_>, reason: DecisionReason, retry_after: Duration) -> Decision {
        let record_id = self.audit(eval, DecisionOutcome::Deferred, reason);
        Decision::Deferred {
            reason,
            retry_after,
            record_id,
        }
    }

    /// Best-effort ledger entry and event for a declined decision.
    fn audit(
        &self,
        eval: &Evaluation<'_>,
        outcome: DecisionOutcome,
        reason: DecisionReason,
    ) -> Option<HandoffId> {
        self.parts.analytics.record_declined(reason);

        let record = HandoffRecord::declined(
            eval.key.clone(),
            eval.transition,
            eval.confidence,
            outcome,
            reason.as_str(),
            eval.now,
        );
        let record_id = match self.parts.ledger.append(&record) {
            Ok(()) => Some(record.id),
            Err(e) => {
                debug!(key = %eval.key, error = %e, "Could not record declined decision");
                None
            }
        };

        self.parts.events.publish(HandoffEvent::DecisionMade {
            record_id,
            conversation_key: eval.key.clone(),
            source: eval.transition.source,
            target: eval.transition.target,
            confidence: eval.confidence,
            outcome,
            reason: reason.as_str().to_string(),
            timestamp: eval.now,
        });
        record_id
    }

    fn refund(&self, permit: &RatePermit) {
        if let Err(e) = self.parts.rate_limits.refund(permit) {
            warn!(key = %permit.key, error = %e, "Failed to refund rate-limit slot");
        }
    }

    pub fn parts(&self) -> &EngineParts {
        &self.parts
    }
}

impl std::fmt::Debug for HandoffDecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffDecisionEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::CoordinationConfig;
    use crate::events::EventBus;
    use crate::lease::LockManager;
    use crate::performance::MemoryPerformanceStore;
    use crate::rate_limit::{MemoryRateLimitStore, RateLimitStore};
    use crate::state::{HandoffStore, MemoryHandoffStore};

    struct Fixture {
        engine: HandoffDecisionEngine,
        clock: Arc<ManualClock>,
        ledger: Arc<MemoryHandoffStore>,
        locks: SharedLockManager,
        rate_limits: Arc<MemoryRateLimitStore>,
    }

    fn fixture_with(config: CoordinationConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let config = ConfigHandle::new(config).unwrap();
        let ledger = Arc::new(MemoryHandoffStore::new());
        let locks = LockManager::new().shared();
        let rate_limits = Arc::new(MemoryRateLimitStore::new());
        let performance = Arc::new(AgentPerformanceMonitor::new(
            Arc::new(MemoryPerformanceStore::new()),
            config.clone(),
            clock.clone(),
        ));
        let engine = HandoffDecisionEngine::new(EngineParts {
            thresholds: Arc::new(ThresholdStore::new(config.current().default_threshold)),
            config,
            clock: clock.clone(),
            rate_limits: rate_limits.clone(),
            locks: locks.clone(),
            performance,
            ledger: ledger.clone(),
            events: EventBus::new().shared(),
            analytics: Arc::new(HandoffAnalytics::new()),
        });
        Fixture {
            engine,
            clock,
            ledger,
            locks,
            rate_limits,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CoordinationConfig::default())
    }

    fn key() -> ConversationKey {
        ConversationKey::new("contact-1")
    }

    fn buyer_profile(confidence: f64) -> IntentProfile {
        IntentProfile::floor().with_confidence(AgentType::Buyer, confidence)
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let f = fixture();
        let profile = buyer_profile(0.9);
        assert_eq!(
            f.engine
                .evaluate(&ConversationKey::new(""), AgentType::Lead, &profile, AgentType::Buyer)
                .unwrap_err(),
            EngineError::EmptyKey
        );
        assert_eq!(
            f.engine
                .evaluate(&key(), AgentType::Buyer, &profile, AgentType::Buyer)
                .unwrap_err(),
            EngineError::SelfTransition(AgentType::Buyer)
        );
        assert!(matches!(
            f.engine
                .evaluate(&key(), AgentType::Lead, &buyer_profile(1.5), AgentType::Buyer),
            Err(EngineError::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_below_confidence_does_not_consume_budget() {
        let f = fixture();
        let decision = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.5), AgentType::Buyer)
            .unwrap();
        assert_eq!(decision.reason(), "below_confidence");
        assert_eq!(decision.outcome(), DecisionOutcome::Rejected);
        assert!(f.rate_limits.state(&key()).unwrap().is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let f = fixture();
        let decision = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.7), AgentType::Buyer)
            .unwrap();
        assert!(decision.is_approved());
    }

    #[test]
    fn test_approval_holds_lock_and_pending_record() {
        let f = fixture();
        let approved = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.9), AgentType::Buyer)
            .unwrap()
            .into_approved()
            .unwrap();
        assert!(f.locks.is_held(&key(), f.clock.now()));
        let pending = f.ledger.pending_for(&key()).unwrap().unwrap();
        assert_eq!(pending.id, approved.record.id);

        let record = approved.lease.complete().unwrap();
        assert_eq!(record.execution_outcome, Some(ExecutionOutcome::Completed));
        assert!(!f.locks.is_held(&key(), f.clock.now()));
    }

    #[test]
    fn test_in_flight_deferral_refunds_budget() {
        let f = fixture();
        let _held = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.9), AgentType::Buyer)
            .unwrap();
        let decision = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.9), AgentType::Buyer)
            .unwrap();
        match decision {
            Decision::Deferred {
                reason,
                retry_after,
                ..
            } => {
                assert_eq!(reason, DecisionReason::InFlight);
                assert_eq!(retry_after, Duration::seconds(120));
            }
            other => panic!("expected in_flight deferral, got {other:?}"),
        }
        let state = f.rate_limits.state(&key()).unwrap().unwrap();
        assert_eq!(state.hourly.count, 1);
    }

    #[test]
    fn test_dropped_lease_marks_abandoned() {
        let f = fixture();
        let decision = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.9), AgentType::Buyer)
            .unwrap();
        let record_id = decision.record_id().unwrap();
        drop(decision);

        let record = f.ledger.get(record_id).unwrap().unwrap();
        assert_eq!(
            record.execution_outcome,
            Some(ExecutionOutcome::failed(crate::state::ABANDONED))
        );
        assert!(!f.locks.is_held(&key(), f.clock.now()));
    }

    #[test]
    fn test_stale_pending_timed_out_on_next_approval() {
        let f = fixture();
        let first = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.9), AgentType::Buyer)
            .unwrap()
            .into_approved()
            .unwrap();
        let stale_id = first.record.id;
        // Runtime went away: lease neither finalized nor dropped.
        std::mem::forget(first);

        f.clock.advance(Duration::seconds(121));
        let second = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.9), AgentType::Buyer)
            .unwrap();
        assert!(second.is_approved());
        let stale = f.ledger.get(stale_id).unwrap().unwrap();
        assert_eq!(
            stale.execution_outcome,
            Some(ExecutionOutcome::failed(EXECUTION_TIMEOUT))
        );
    }

    #[test]
    fn test_declined_decisions_are_recorded() {
        let f = fixture();
        let decision = f
            .engine
            .evaluate(&key(), AgentType::Lead, &buyer_profile(0.2), AgentType::Buyer)
            .unwrap();
        let id = decision.record_id().unwrap();
        let record = f.ledger.get(id).unwrap().unwrap();
        assert_eq!(record.decision_outcome, DecisionOutcome::Rejected);
        assert_eq!(record.deferral_reason.as_deref(), Some("below_confidence"));
        assert_eq!(record.execution_outcome, None);
    }
}
