//! Integration tests for the handoff coordinator
//!
//! Drives the full analyze → evaluate → execute → learn flow through the
//! public facade with a manual clock, covering the end-to-end scenarios and
//! the liveness and cycle-prevention guarantees.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use handoff_coordination::clock::{Clock, ManualClock};
use handoff_coordination::decision::DecisionReason;
use handoff_coordination::executor::TRANSFER_TIMEOUT;
use handoff_coordination::lease::{LockAcquisition, LockManager};
use handoff_coordination::rate_limit::{RateCaps, RateLimitOutcome};
use handoff_coordination::state::{ABANDONED, EXECUTION_TIMEOUT};
use handoff_coordination::{
    AgentTransfer, AgentType, ConversationKey, CoordinationConfig, Decision, DecisionOutcome,
    EventFilter, ExecutionOutcome, ExecutionRequest, HandoffCoordinator, HandoffEvent,
    IntentProfile, Message, OutcomeResult, TransferError, Transition,
};

/// Coordinator on a manual clock with default config
fn coordinator_with(config: CoordinationConfig) -> (HandoffCoordinator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let coordinator = HandoffCoordinator::builder(config)
        .clock(clock.clone())
        .build()
        .expect("default config is valid");
    (coordinator, clock)
}

fn coordinator() -> (HandoffCoordinator, Arc<ManualClock>) {
    coordinator_with(CoordinationConfig::default())
}

fn profile(target: AgentType, confidence: f64) -> IntentProfile {
    IntentProfile::floor().with_confidence(target, confidence)
}

fn approve(
    coordinator: &HandoffCoordinator,
    key: &ConversationKey,
    source: AgentType,
    target: AgentType,
) -> handoff_coordination::ApprovedHandoff {
    match coordinator
        .evaluate(key, source, &profile(target, 0.9), target)
        .unwrap()
    {
        Decision::Approved(approved) => approved,
        other => panic!("expected approval, got {:?}", other.summary()),
    }
}

/// Transfer collaborator that records requests and answers from a script
struct ScriptedTransfer {
    calls: Mutex<Vec<ExecutionRequest>>,
    failure: Option<String>,
    delay: Option<StdDuration>,
}

impl ScriptedTransfer {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failure: None,
            delay: None,
        })
    }

    fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failure: Some(reason.to_string()),
            delay: None,
        })
    }

    fn stalling(delay: StdDuration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failure: None,
            delay: Some(delay),
        })
    }
}

#[async_trait]
impl AgentTransfer for ScriptedTransfer {
    async fn transfer(&self, request: &ExecutionRequest) -> Result<(), TransferError> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(reason) => Err(TransferError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }
}

// ── End-to-end scenarios ───────────────────────────────────────────

/// Test: confident profile with no contention is approved
#[test]
fn test_scenario_a_confident_profile_approved() {
    let (coordinator, _) = coordinator();
    let key = ConversationKey::new("contact-a");
    let decision = coordinator
        .evaluate(&key, AgentType::Lead, &profile(AgentType::Buyer, 0.85), AgentType::Buyer)
        .unwrap();

    assert!(decision.is_approved());
    let approved = decision.into_approved().unwrap();
    assert_eq!(approved.record.decision_outcome, DecisionOutcome::Approved);
    assert_eq!(approved.record.execution_outcome, Some(ExecutionOutcome::Pending));
    assert_eq!(
        coordinator.ledger().pending_for(&key).unwrap().map(|r| r.id),
        Some(approved.record.id)
    );
}

/// Test: hourly cap already reached rejects without incrementing again
#[test]
fn test_scenario_b_rate_limited_counter_unchanged() {
    let (coordinator, clock) = coordinator();
    let key = ConversationKey::new("contact-b");
    let caps = RateCaps {
        hourly: 3,
        daily: 10,
    };
    for _ in 0..3 {
        assert!(matches!(
            coordinator
                .rate_limits()
                .check_and_increment(&key, caps, clock.now())
                .unwrap(),
            RateLimitOutcome::Allowed(_)
        ));
    }

    let decision = coordinator
        .evaluate(&key, AgentType::Lead, &profile(AgentType::Buyer, 0.85), AgentType::Buyer)
        .unwrap();
    assert_eq!(decision.decline_reason(), Some(DecisionReason::RateLimited));
    assert_eq!(decision.reason(), "rate_limited");

    let state = coordinator.rate_limits().state(&key).unwrap().unwrap();
    assert_eq!(state.hourly.count, 3);
    assert_eq!(state.daily.count, 3);
}

/// Test: target over its SLA is deferred with the configured backoff
#[test]
fn test_scenario_c_degraded_target_deferred() {
    let mut config = CoordinationConfig::default();
    config.sla_target_ms.set(AgentType::Buyer, 300);
    let (coordinator, _) = coordinator_with(config);
    for _ in 0..50 {
        coordinator.record_sample(AgentType::Buyer, 500, true);
    }
    assert_eq!(coordinator.performance(AgentType::Buyer).p95_ms, 500);

    let key = ConversationKey::new("contact-c");
    match coordinator
        .evaluate(&key, AgentType::Lead, &profile(AgentType::Buyer, 0.85), AgentType::Buyer)
        .unwrap()
    {
        Decision::Deferred {
            reason,
            retry_after,
            ..
        } => {
            assert_eq!(reason, DecisionReason::TargetDegraded);
            assert_eq!(retry_after, Duration::seconds(300));
        }
        other => panic!("expected deferral, got {:?}", other.summary()),
    }
    // Deferral gives the slot back
    assert_eq!(
        coordinator.rate_limits().state(&key).unwrap().unwrap().hourly.count,
        0
    );
}

/// Test: converted-above / lost-below evidence raises the threshold toward the cut
#[test]
fn test_scenario_d_recalibration_raises_threshold() {
    let (coordinator, _) = coordinator();
    let lead_to_seller = Transition::new(AgentType::Lead, AgentType::Seller);
    for confidence in [0.75, 0.77, 0.8, 0.82, 0.85, 0.9, 0.92, 0.95] {
        coordinator
            .record_outcome(lead_to_seller, confidence, OutcomeResult::Converted)
            .unwrap();
    }
    for _ in 0..2 {
        coordinator
            .record_outcome(lead_to_seller, 0.72, OutcomeResult::Lost)
            .unwrap();
    }

    let before = coordinator.threshold(lead_to_seller);
    let report = coordinator.recalibrate();
    let after = coordinator.threshold(lead_to_seller);

    assert_eq!(before, 0.7);
    assert_eq!(report.adjusted.len(), 1);
    assert!(after > before, "threshold should rise, got {after}");
    assert!(after <= 0.75, "threshold should not overshoot the cut, got {after}");

    let profile = coordinator
        .threshold_profiles()
        .into_iter()
        .find(|p| p.transition == lead_to_seller)
        .unwrap();
    assert_eq!(profile.sample_count, 10);
    assert!(profile.last_adjusted_at.is_some());
}

/// Test: transcript-driven flow from analysis through execution
#[tokio::test]
async fn test_transcript_to_completed_transfer() {
    let (coordinator, clock) = coordinator();
    let key = ConversationKey::new("contact-e2e");
    let now = clock.now();
    let history = vec![
        Message::user("Hi, we want to sell our house this spring", now),
        Message::agent("Happy to help. Do you know what it's worth?", now),
        Message::user("What's my home worth? We might take a cash offer", now),
    ];

    let (target, decision) = coordinator
        .evaluate_best_target(&key, AgentType::Lead, &history)
        .unwrap()
        .unwrap();
    assert_eq!(target, AgentType::Seller);

    let transfer = ScriptedTransfer::succeeding();
    let record = coordinator
        .execute(decision.into_approved().unwrap(), transfer.clone())
        .await
        .unwrap();

    assert_eq!(record.execution_outcome, Some(ExecutionOutcome::Completed));
    let calls = transfer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].transition, Transition::new(AgentType::Lead, AgentType::Seller));
    assert_eq!(calls[0].lease_expires_at, now + Duration::seconds(120));
    assert_eq!(coordinator.analytics().executions_completed, 1);
}

// ── Execution ──────────────────────────────────────────────────────

/// Test: a failed transfer finalizes the record and frees the conversation
#[tokio::test]
async fn test_failed_transfer_releases_lock() {
    let (coordinator, _) = coordinator();
    let key = ConversationKey::new("contact-fail");
    let approved = approve(&coordinator, &key, AgentType::Lead, AgentType::Buyer);

    let record = coordinator
        .execute(approved, ScriptedTransfer::failing("crm unavailable"))
        .await
        .unwrap();
    assert!(matches!(
        record.execution_outcome,
        Some(ExecutionOutcome::Failed { ref reason }) if reason.contains("crm unavailable")
    ));

    // Not in flight, and a failed transfer does not count as circular
    let retry = coordinator
        .evaluate(&key, AgentType::Lead, &profile(AgentType::Buyer, 0.9), AgentType::Buyer)
        .unwrap();
    assert!(retry.is_approved());
    assert_eq!(coordinator.analytics().executions_failed, 1);
}

/// Test: a transfer that outlives its lease is failed with transfer_timeout
#[tokio::test(start_paused = true)]
async fn test_stalled_transfer_times_out() {
    let (coordinator, _) = coordinator();
    let key = ConversationKey::new("contact-stall");
    let approved = approve(&coordinator, &key, AgentType::Lead, AgentType::Seller);

    let record = coordinator
        .execute(approved, ScriptedTransfer::stalling(StdDuration::from_secs(600)))
        .await
        .unwrap();
    assert_eq!(
        record.execution_outcome,
        Some(ExecutionOutcome::failed(TRANSFER_TIMEOUT))
    );
}

/// Test: dropping an approval without executing marks it abandoned
#[test]
fn test_dropped_approval_abandoned() {
    let (coordinator, _) = coordinator();
    let key = ConversationKey::new("contact-drop");
    let id = {
        let approved = approve(&coordinator, &key, AgentType::Buyer, AgentType::Seller);
        approved.record.id
    };
    let record = coordinator.ledger().get(id).unwrap().unwrap();
    assert_eq!(record.execution_outcome, Some(ExecutionOutcome::failed(ABANDONED)));
    assert!(coordinator
        .evaluate(&key, AgentType::Buyer, &profile(AgentType::Seller, 0.9), AgentType::Seller)
        .unwrap()
        .is_approved());
}

// ── Liveness and mutual exclusion ──────────────────────────────────

/// Test: a lease that is never released is reclaimable after its TTL
#[test]
fn test_unreleased_lease_reclaimable_after_ttl() {
    let (coordinator, clock) = coordinator();
    let key = ConversationKey::new("contact-crash");
    let crashed = approve(&coordinator, &key, AgentType::Lead, AgentType::Buyer);
    let crashed_id = crashed.record.id;
    // Simulate a runtime crash: the lease is never finalized or dropped.
    std::mem::forget(crashed);

    clock.advance(Duration::seconds(60));
    match coordinator
        .evaluate(&key, AgentType::Lead, &profile(AgentType::Buyer, 0.9), AgentType::Buyer)
        .unwrap()
    {
        Decision::Deferred {
            reason,
            retry_after,
            ..
        } => {
            assert_eq!(reason, DecisionReason::InFlight);
            assert_eq!(retry_after, Duration::seconds(60));
        }
        other => panic!("expected in_flight deferral, got {:?}", other.summary()),
    }

    clock.advance(Duration::seconds(61));
    let approved = approve(&coordinator, &key, AgentType::Lead, AgentType::Buyer);
    assert_ne!(approved.record.id, crashed_id);

    let crashed = coordinator.ledger().get(crashed_id).unwrap().unwrap();
    assert_eq!(
        crashed.execution_outcome,
        Some(ExecutionOutcome::failed(EXECUTION_TIMEOUT))
    );
    assert_eq!(
        coordinator.ledger().pending_for(&key).unwrap().map(|r| r.id),
        Some(approved.record.id)
    );
}

/// Test: the sweeper frees a crashed conversation without a new evaluation
#[test]
fn test_sweeper_times_out_crashed_execution() {
    let (coordinator, clock) = coordinator();
    let key = ConversationKey::new("contact-sweep");
    let crashed = approve(&coordinator, &key, AgentType::Seller, AgentType::Buyer);
    let crashed_id = crashed.record.id;
    std::mem::forget(crashed);

    clock.advance(Duration::seconds(121));
    let report = coordinator.sweep();
    assert_eq!(report.leases_reclaimed, 1);
    assert_eq!(report.records_timed_out, 1);
    assert!(coordinator.ledger().pending_for(&key).unwrap().is_none());
    assert_eq!(
        coordinator
            .ledger()
            .get(crashed_id)
            .unwrap()
            .unwrap()
            .execution_outcome,
        Some(ExecutionOutcome::failed(EXECUTION_TIMEOUT))
    );
    assert_eq!(coordinator.analytics().executions_timed_out, 1);
}

/// Test: release is idempotent and never frees a later holder
#[test]
fn test_release_idempotent_and_token_checked() {
    let locks = LockManager::new();
    let key = ConversationKey::new("contact-lock");
    let clock = ManualClock::starting_now();
    let ttl = Duration::seconds(120);

    let LockAcquisition::Acquired(first) = locks.try_acquire(&key, ttl, clock.now()) else {
        panic!("first acquisition should succeed");
    };
    assert!(locks.release(&first));
    assert!(!locks.release(&first));

    let LockAcquisition::Acquired(second) = locks.try_acquire(&key, ttl, clock.now()) else {
        panic!("second acquisition should succeed");
    };
    clock.advance(Duration::seconds(121));
    let LockAcquisition::Acquired(third) = locks.try_acquire(&key, ttl, clock.now()) else {
        panic!("expired lease should be taken over");
    };

    // Stale handles never unlock the current holder
    assert!(!locks.release(&first));
    assert!(!locks.release(&second));
    assert!(locks.is_held(&key, clock.now()));
    assert!(locks.release(&third));
}

// ── Cycle prevention ───────────────────────────────────────────────

/// Test: reverse handoff blocked inside the window, eligible after it
#[tokio::test]
async fn test_reverse_handoff_blocked_within_window() {
    let (coordinator, clock) = coordinator();
    let key = ConversationKey::new("contact-cycle");
    let approved = approve(&coordinator, &key, AgentType::Lead, AgentType::Buyer);
    coordinator
        .execute(approved, ScriptedTransfer::succeeding())
        .await
        .unwrap();

    clock.advance(Duration::minutes(10));
    let bounce = coordinator
        .evaluate(&key, AgentType::Buyer, &profile(AgentType::Lead, 0.95), AgentType::Lead)
        .unwrap();
    assert_eq!(bounce.reason(), "circular");
    assert!(matches!(bounce, Decision::Rejected { .. }));

    let repeat = coordinator
        .evaluate(&key, AgentType::Lead, &profile(AgentType::Buyer, 0.95), AgentType::Buyer)
        .unwrap();
    assert_eq!(repeat.decline_reason(), Some(DecisionReason::Circular));

    clock.advance(Duration::minutes(21));
    let later = coordinator
        .evaluate(&key, AgentType::Buyer, &profile(AgentType::Lead, 0.95), AgentType::Lead)
        .unwrap();
    assert!(later.is_approved());

    let snapshot = coordinator.analytics();
    assert_eq!(snapshot.blocked_by_circular, 2);
    assert_eq!(snapshot.approved, 2);
}

// ── Observation ────────────────────────────────────────────────────

/// Test: decisions and finalizations are published on the event bus
#[tokio::test]
async fn test_events_published_for_decision_and_execution() {
    let (coordinator, _) = coordinator();
    let key = ConversationKey::new("contact-events");
    let mut events = coordinator.subscribe(
        EventFilter::new()
            .conversation(&key)
            .types(vec!["decision_made", "execution_finalized"]),
    );

    let approved = approve(&coordinator, &key, AgentType::Lead, AgentType::Buyer);
    let record_id = approved.record.id;
    coordinator
        .execute(approved, ScriptedTransfer::succeeding())
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        HandoffEvent::DecisionMade {
            record_id: id,
            outcome,
            reason,
            ..
        } => {
            assert_eq!(id, Some(record_id));
            assert_eq!(outcome, DecisionOutcome::Approved);
            assert_eq!(reason, "approved");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match events.recv().await.unwrap() {
        HandoffEvent::ExecutionFinalized { outcome, .. } => {
            assert_eq!(outcome, ExecutionOutcome::Completed);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Test: every declined decision leaves an audit record
#[test]
fn test_declined_decisions_audited() {
    let (coordinator, _) = coordinator();
    let key = ConversationKey::new("contact-audit");
    let decision = coordinator
        .evaluate(&key, AgentType::Lead, &profile(AgentType::Buyer, 0.4), AgentType::Buyer)
        .unwrap();
    assert_eq!(decision.reason(), "below_confidence");

    let records = coordinator.ledger().records_for(&key).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision_outcome, DecisionOutcome::Rejected);
    assert_eq!(records[0].deferral_reason.as_deref(), Some("below_confidence"));
    assert_eq!(records[0].execution_outcome, None);
    assert_eq!(coordinator.analytics().blocked_by_confidence, 1);
}
