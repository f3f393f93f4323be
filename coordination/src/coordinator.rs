//! Coordinator facade
//!
//! [`HandoffCoordinator`] wires every component from one
//! [`CoordinationConfig`]: analyzer, decision engine, performance monitor,
//! learner, sweeper and the stores behind them. Stores default to the
//! in-memory implementations; a runtime that needs durability swaps in its
//! own through the builder.
//!
//! ```ignore
//! use handoff_coordination::{AgentType, CoordinationConfig, HandoffCoordinator};
//!
//! let coordinator = HandoffCoordinator::builder(CoordinationConfig::from_env()).build()?;
//! let background = coordinator.spawn_background();
//!
//! let decision = coordinator.evaluate_history(&key, AgentType::Lead, &history, AgentType::Buyer)?;
//! if let Some(approved) = decision.into_approved() {
//!     coordinator.execute(approved, transfer.clone()).await?;
//! }
//!
//! background.shutdown().await;
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analytics::{AnalyticsSnapshot, HandoffAnalytics};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{ConfigError, ConfigHandle, CoordinationConfig};
use crate::decision::{ApprovedHandoff, Decision, EngineError, EngineParts, HandoffDecisionEngine};
use crate::events::{EventBus, EventFilter, FilteredReceiver, HandoffEvent, SharedEventBus};
use crate::executor::{AgentTransfer, HandoffExecutor};
use crate::intent::{AnalysisError, IntentAnalyzer, IntentProfile, PatternAnalyzer};
use crate::learner::{
    calibration_task, CalibrationReport, LearnerError, OutcomeRecorder, OutcomeResult,
};
use crate::lease::LockManager;
use crate::performance::{
    AgentPerformanceMonitor, AgentPerformanceSnapshot, MemoryPerformanceStore, PerformanceStore,
};
use crate::rate_limit::{MemoryRateLimitStore, SharedRateLimitStore};
use crate::state::{
    HandoffRecord, MemoryHandoffStore, SharedCheckpointStore, SharedHandoffStore, StoreError,
};
use crate::sweeper::{LeaseSweeper, SweepReport};
use crate::thresholds::{ThresholdProfile, ThresholdStore};
use crate::types::{AgentType, ConversationKey, Message, Transition};

/// Errors surfaced by the coordinator facade
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Learner(#[from] LearnerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Builder for [`HandoffCoordinator`]
pub struct HandoffCoordinatorBuilder {
    config: CoordinationConfig,
    clock: Option<SharedClock>,
    analyzer: Option<Arc<dyn IntentAnalyzer>>,
    ledger: Option<SharedHandoffStore>,
    rate_limits: Option<SharedRateLimitStore>,
    performance: Option<Arc<dyn PerformanceStore>>,
    checkpoints: Option<SharedCheckpointStore>,
    events: Option<SharedEventBus>,
}

impl HandoffCoordinatorBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn IntentAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn ledger(mut self, ledger: SharedHandoffStore) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn rate_limits(mut self, rate_limits: SharedRateLimitStore) -> Self {
        self.rate_limits = Some(rate_limits);
        self
    }

    pub fn performance_store(mut self, store: Arc<dyn PerformanceStore>) -> Self {
        self.performance = Some(store);
        self
    }

    pub fn checkpoints(mut self, store: SharedCheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Use one RocksDB instance for the ledger, rate limits and checkpoints.
    #[cfg(feature = "heavy-state")]
    pub fn rocks(self, store: crate::state::SharedRocksStateStore) -> Self {
        self.ledger(store.clone())
            .rate_limits(store.clone())
            .checkpoints(store)
    }

    /// Validate the config, wire the components and restore checkpoints.
    ///
    /// A checkpoint that cannot be read is logged and skipped; the
    /// coordinator starts with default thresholds.
    pub fn build(self) -> CoordinatorResult<HandoffCoordinator> {
        let config = ConfigHandle::new(self.config)?;
        let current = config.current();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new().shared());
        let thresholds = Arc::new(ThresholdStore::new(current.default_threshold));
        let analytics = Arc::new(HandoffAnalytics::new());
        let locks = LockManager::new().shared();
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(MemoryHandoffStore::new()));
        let rate_limits = self
            .rate_limits
            .unwrap_or_else(|| Arc::new(MemoryRateLimitStore::new()));
        let performance = Arc::new(AgentPerformanceMonitor::new(
            self.performance
                .unwrap_or_else(|| Arc::new(MemoryPerformanceStore::new())),
            config.clone(),
            clock.clone(),
        ));

        let mut learner = OutcomeRecorder::new(
            thresholds.clone(),
            config.clone(),
            clock.clone(),
            events.clone(),
        );
        if let Some(store) = self.checkpoints {
            learner = learner.with_checkpoints(store);
        }
        if let Err(e) = learner.restore() {
            warn!(error = %e, "Failed to restore learner checkpoint, starting from defaults");
        }

        let sweeper = Arc::new(LeaseSweeper::new(
            locks.clone(),
            ledger.clone(),
            config.clone(),
            clock.clone(),
            events.clone(),
            analytics.clone(),
        ));
        let engine = HandoffDecisionEngine::new(EngineParts {
            config: config.clone(),
            clock: clock.clone(),
            thresholds,
            rate_limits,
            locks,
            performance: performance.clone(),
            ledger,
            events,
            analytics,
        });

        info!(
            hourly_cap = current.hourly_cap,
            daily_cap = current.daily_cap,
            default_threshold = current.default_threshold,
            "Handoff coordinator ready"
        );

        Ok(HandoffCoordinator {
            config,
            clock,
            analyzer: self
                .analyzer
                .unwrap_or_else(|| Arc::new(PatternAnalyzer::new())),
            engine,
            performance,
            learner: Arc::new(learner),
            sweeper,
        })
    }
}

/// Handles for the sweeper and calibration tasks.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

/// Entry point for the runtime.
pub struct HandoffCoordinator {
    config: ConfigHandle,
    clock: SharedClock,
    analyzer: Arc<dyn IntentAnalyzer>,
    engine: HandoffDecisionEngine,
    performance: Arc<AgentPerformanceMonitor>,
    learner: Arc<OutcomeRecorder>,
    sweeper: Arc<LeaseSweeper>,
}

impl HandoffCoordinator {
    pub fn builder(config: CoordinationConfig) -> HandoffCoordinatorBuilder {
        HandoffCoordinatorBuilder {
            config,
            clock: None,
            analyzer: None,
            ledger: None,
            rate_limits: None,
            performance: None,
            checkpoints: None,
            events: None,
        }
    }

    /// Coordinator with in-memory stores and the system clock.
    pub fn in_memory(config: CoordinationConfig) -> CoordinatorResult<Self> {
        Self::builder(config).build()
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    pub fn analyze(&self, history: &[Message]) -> CoordinatorResult<IntentProfile> {
        Ok(self.analyzer.analyze(history)?)
    }

    pub fn evaluate(
        &self,
        key: &ConversationKey,
        source: AgentType,
        profile: &IntentProfile,
        target: AgentType,
    ) -> CoordinatorResult<Decision> {
        Ok(self.engine.evaluate(key, source, profile, target)?)
    }

    /// Analyze the transcript, then evaluate the handoff to `target`.
    pub fn evaluate_history(
        &self,
        key: &ConversationKey,
        source: AgentType,
        history: &[Message],
        target: AgentType,
    ) -> CoordinatorResult<Decision> {
        let profile = self.analyze(history)?;
        self.evaluate(key, source, &profile, target)
    }

    /// Evaluate a handoff to whichever other agent the transcript favors.
    ///
    /// Returns `None` when no other agent has any confidence at all.
    pub fn evaluate_best_target(
        &self,
        key: &ConversationKey,
        source: AgentType,
        history: &[Message],
    ) -> CoordinatorResult<Option<(AgentType, Decision)>> {
        let profile = self.analyze(history)?;
        let Some((target, _)) = profile.best_target(source).filter(|(_, c)| *c > 0.0) else {
            return Ok(None);
        };
        let decision = self.evaluate(key, source, &profile, target)?;
        Ok(Some((target, decision)))
    }

    /// Run the transfer for an approved handoff and finalize its record.
    pub async fn execute(
        &self,
        approved: ApprovedHandoff,
        transfer: Arc<dyn AgentTransfer>,
    ) -> CoordinatorResult<HandoffRecord> {
        let executor = HandoffExecutor::new(transfer, self.clock.clone());
        Ok(executor.execute(approved).await?)
    }

    // =========================================================================
    // Feedback
    // =========================================================================

    pub fn record_sample(&self, agent: AgentType, latency_ms: u64, succeeded: bool) {
        self.performance.record_sample(agent, latency_ms, succeeded);
    }

    pub fn record_outcome(
        &self,
        transition: Transition,
        confidence: f64,
        result: OutcomeResult,
    ) -> CoordinatorResult<()> {
        self.learner.record_outcome(transition, confidence, result)?;
        Ok(())
    }

    pub fn recalibrate(&self) -> CalibrationReport {
        self.learner.recalibrate()
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweeper.sweep()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn config(&self) -> Arc<CoordinationConfig> {
        self.config.current()
    }

    /// Publish a new configuration to every component.
    ///
    /// An invalid config is rejected and the current one stays active.
    pub fn reload_config(&self, config: CoordinationConfig) -> CoordinatorResult<()> {
        config.validate()?;
        let default_threshold = config.default_threshold;
        self.config.update(config)?;
        if let Err(e) = self
            .engine
            .parts()
            .thresholds
            .set_default(default_threshold)
        {
            warn!(error = %e, "Failed to apply default threshold");
        }
        let now = self.clock.now();
        self.engine
            .parts()
            .events
            .publish(HandoffEvent::ConfigReloaded { timestamp: now });
        info!("Coordination config reloaded");
        Ok(())
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn analytics(&self) -> AnalyticsSnapshot {
        self.engine.parts().analytics.snapshot()
    }

    pub fn threshold(&self, transition: Transition) -> f64 {
        self.engine.parts().thresholds.get_threshold(transition)
    }

    pub fn threshold_profiles(&self) -> Vec<ThresholdProfile> {
        self.engine.parts().thresholds.profiles()
    }

    pub fn thresholds(&self) -> Arc<ThresholdStore> {
        self.engine.parts().thresholds.clone()
    }

    pub fn performance(&self, agent: AgentType) -> AgentPerformanceSnapshot {
        self.performance.snapshot(agent)
    }

    pub fn ledger(&self) -> SharedHandoffStore {
        self.engine.parts().ledger.clone()
    }

    pub fn rate_limits(&self) -> SharedRateLimitStore {
        self.engine.parts().rate_limits.clone()
    }

    pub fn subscribe(&self, filter: EventFilter) -> FilteredReceiver {
        self.engine.parts().events.subscribe_filtered(filter)
    }

    pub fn events(&self) -> SharedEventBus {
        self.engine.parts().events.clone()
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Start the lease sweeper and the calibration task on the current
    /// runtime. Intervals come from the config at spawn time.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let (shutdown, rx) = watch::channel(false);
        let config = self.config.current();
        let handles = vec![
            tokio::spawn(
                self.sweeper
                    .clone()
                    .run(config.sweep_interval(), rx.clone()),
            ),
            tokio::spawn(calibration_task(
                self.learner.clone(),
                config.calibration_interval(),
                rx,
            )),
        ];
        BackgroundTasks { shutdown, handles }
    }
}

impl std::fmt::Debug for HandoffCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffCoordinator")
            .field("config", &self.config.current())
            .field("sweeper", &self.sweeper)
            .finish_non_exhaustive()
    }
}
