//! Threshold learning from handoff outcomes.
//!
//! Every executed handoff eventually produces a business outcome: the
//! contact converted with the new agent, had to be nurtured, or was lost.
//! Outcomes are logged per transition; a periodic calibration pass moves
//! each transition's threshold toward the confidence that best separates
//! converted from lost handoffs.
//!
//! The separating cut is the candidate confidence `t` that maximizes
//! `#converted(c >= t) + #lost(c < t)`, ties going to the lowest `t`. The
//! new threshold blends the current one with the cut, weighted by
//! `n / (n + prior_weight)`, so small samples move the threshold only a
//! little. Transitions with fewer than `min_samples_for_calibration`
//! outcomes, or without both converted and lost outcomes, are left alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::ConfigHandle;
use crate::events::{HandoffEvent, SharedEventBus};
use crate::state::{SharedCheckpointStore, StoreResult};
use crate::thresholds::ThresholdStore;
use crate::types::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeResult {
    Converted,
    Nurtured,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSample {
    pub transition: Transition,
    pub confidence: f64,
    pub result: OutcomeResult,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LearnerError {
    #[error("{0} is not a valid transition")]
    SelfTransition(Transition),

    #[error("confidence {0} is outside [0, 1]")]
    InvalidConfidence(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientSamples,
    /// Only one of converted/lost was observed
    NoContrast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationChange {
    pub transition: Transition,
    pub previous: f64,
    pub threshold: f64,
    pub cut: f64,
    pub sample_count: usize,
}

/// Result of one calibration pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub adjusted: Vec<CalibrationChange>,
    pub skipped: Vec<(Transition, SkipReason)>,
    pub failed: Vec<(Transition, String)>,
}

/// Confidence that best separates converted from lost outcomes.
///
/// `None` unless both classes are present.
pub fn separating_cut(samples: &[OutcomeSample]) -> Option<f64> {
    let converted: Vec<f64> = samples
        .iter()
        .filter(|s| s.result == OutcomeResult::Converted)
        .map(|s| s.confidence)
        .collect();
    let lost: Vec<f64> = samples
        .iter()
        .filter(|s| s.result == OutcomeResult::Lost)
        .map(|s| s.confidence)
        .collect();
    if converted.is_empty() || lost.is_empty() {
        return None;
    }

    let mut candidates: Vec<f64> = converted.iter().chain(lost.iter()).copied().collect();
    candidates.sort_by(f64::total_cmp);
    candidates.dedup();

    let mut best: Option<(usize, f64)> = None;
    for t in candidates {
        let correct = converted.iter().filter(|c| **c >= t).count()
            + lost.iter().filter(|c| **c < t).count();
        match best {
            Some((score, _)) if correct <= score => {}
            _ => best = Some((correct, t)),
        }
    }
    best.map(|(_, t)| t)
}

/// Outcome log and calibration logic.
pub struct OutcomeRecorder {
    log: Mutex<BTreeMap<Transition, VecDeque<OutcomeSample>>>,
    thresholds: Arc<ThresholdStore>,
    config: ConfigHandle,
    clock: SharedClock,
    events: SharedEventBus,
    checkpoints: Option<SharedCheckpointStore>,
}

impl OutcomeRecorder {
    pub fn new(
        thresholds: Arc<ThresholdStore>,
        config: ConfigHandle,
        clock: SharedClock,
        events: SharedEventBus,
    ) -> Self {
        Self {
            log: Mutex::new(BTreeMap::new()),
            thresholds,
            config,
            clock,
            events,
            checkpoints: None,
        }
    }

    /// Persist outcomes and calibrated thresholds to `store`.
    pub fn with_checkpoints(mut self, store: SharedCheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Reload thresholds and the outcome log from the checkpoint store.
    /// Returns `(thresholds restored, outcomes loaded)`.
    pub fn restore(&self) -> StoreResult<(usize, usize)> {
        let Some(store) = &self.checkpoints else {
            return Ok((0, 0));
        };
        let restored = self.thresholds.restore(&store.load_thresholds()?);
        let loaded = self.load_outcomes(store.load_outcomes()?);
        info!(thresholds = restored, outcomes = loaded, "Restored learner checkpoint");
        Ok((restored, loaded))
    }

    /// Log one outcome and return the logged sample. Oldest outcomes are
    /// evicted past the per-transition cap.
    pub fn record_outcome(
        &self,
        transition: Transition,
        confidence: f64,
        result: OutcomeResult,
    ) -> Result<OutcomeSample, LearnerError> {
        if transition.is_self_loop() {
            return Err(LearnerError::SelfTransition(transition));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(LearnerError::InvalidConfidence(confidence));
        }
        let sample = OutcomeSample {
            transition,
            confidence,
            result,
            recorded_at: self.clock.now(),
        };
        self.push(sample);
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.append_outcome(&sample) {
                warn!(%transition, error = %e, "Failed to persist outcome");
            }
        }
        debug!(%transition, confidence, ?result, "Outcome recorded");
        Ok(sample)
    }

    /// Bulk-load historical outcomes (e.g. from a previous run). Invalid
    /// samples are skipped. Returns how many were loaded.
    pub fn load_outcomes(&self, samples: impl IntoIterator<Item = OutcomeSample>) -> usize {
        let mut loaded = 0;
        for sample in samples {
            if sample.transition.is_self_loop() || !(0.0..=1.0).contains(&sample.confidence) {
                continue;
            }
            self.push(sample);
            loaded += 1;
        }
        loaded
    }

    fn push(&self, sample: OutcomeSample) {
        let cap = self.config.current().max_outcomes_per_transition.max(1);
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = log.entry(sample.transition).or_default();
        entries.push_back(sample);
        while entries.len() > cap {
            entries.pop_front();
        }
    }

    pub fn sample_count(&self, transition: Transition) -> usize {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&transition)
            .map_or(0, VecDeque::len)
    }

    pub fn outcomes(&self, transition: Transition) -> Vec<OutcomeSample> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&transition)
            .map(|entries| entries.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Run one calibration pass over every transition with logged outcomes.
    ///
    /// Each transition is handled independently; a failure on one never
    /// affects the others.
    pub fn recalibrate(&self) -> CalibrationReport {
        let config = self.config.current();
        let snapshot: Vec<(Transition, Vec<OutcomeSample>)> = {
            let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            log.iter()
                .map(|(t, entries)| (*t, entries.iter().copied().collect()))
                .collect()
        };
        let now = self.clock.now();
        let mut report = CalibrationReport::default();

        for (transition, samples) in snapshot {
            let n = samples.len();
            if n < config.min_samples_for_calibration {
                report
                    .skipped
                    .push((transition, SkipReason::InsufficientSamples));
                continue;
            }
            let Some(cut) = separating_cut(&samples) else {
                report.skipped.push((transition, SkipReason::NoContrast));
                continue;
            };

            let previous = self.thresholds.get_threshold(transition);
            let weight = n as f64 / (n as f64 + config.calibration_prior_weight);
            let proposed = previous + weight * (cut - previous);
            if !proposed.is_finite() {
                report
                    .failed
                    .push((transition, format!("non-finite threshold {proposed}")));
                continue;
            }

            match self
                .thresholds
                .apply_calibration(transition, proposed, n as u64, now)
            {
                Ok(threshold) => {
                    info!(%transition, previous, threshold, cut, samples = n, "Threshold recalibrated");
                    self.events.publish(HandoffEvent::ThresholdCalibrated {
                        transition,
                        previous,
                        threshold,
                        sample_count: n,
                        timestamp: now,
                    });
                    report.adjusted.push(CalibrationChange {
                        transition,
                        previous,
                        threshold,
                        cut,
                        sample_count: n,
                    });
                }
                Err(e) => {
                    warn!(%transition, error = %e, "Threshold calibration failed");
                    report.failed.push((transition, e.to_string()));
                }
            }
        }

        match &self.checkpoints {
            Some(store) if !report.adjusted.is_empty() => {
                if let Err(e) = store.save_thresholds(&self.thresholds.profiles()) {
                    warn!(error = %e, "Failed to checkpoint thresholds");
                }
            }
            _ => {}
        }
        report
    }
}

impl std::fmt::Debug for OutcomeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeRecorder").finish_non_exhaustive()
    }
}

/// Recalibrate on a fixed interval until `shutdown` flips to `true`.
pub async fn calibration_task(
    recorder: Arc<OutcomeRecorder>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = period.as_secs(), "Starting threshold calibration task");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately; calibrate only after a full period.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = recorder.recalibrate();
                debug!(
                    adjusted = report.adjusted.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "Calibration pass complete"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Threshold calibration task shutting down");
                    break;
                }
            }
        }
    }
}
