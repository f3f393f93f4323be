//! Per-transition confidence thresholds.
//!
//! The decision engine reads a threshold on every evaluation while the
//! learner writes one at most once per calibration cycle. Reads are a single
//! atomic load; writes are serialized behind a mutex so a calibration and a
//! manual override never interleave.
//!
//! Values are clamped to `[MIN_THRESHOLD, MAX_THRESHOLD]` on write, so a
//! degenerate statistic can never open or close a transition entirely.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::config::DEFAULT_THRESHOLD;
use crate::types::{AgentType, Transition};

pub const MIN_THRESHOLD: f64 = 0.3;
pub const MAX_THRESHOLD: f64 = 0.95;

const TRANSITION_SLOTS: usize = AgentType::COUNT * AgentType::COUNT;
const NEVER: i64 = i64::MIN;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdError {
    #[error("threshold must be finite, got {0}")]
    NonFinite(f64),

    #[error("{0} is not a valid transition")]
    SelfTransition(Transition),
}

/// Snapshot of one transition's threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdProfile {
    pub transition: Transition,
    pub confidence_threshold: f64,
    /// Outcomes the last calibration was based on (0 for manual overrides).
    pub sample_count: u64,
    pub last_adjusted_at: Option<DateTime<Utc>>,
    /// False while the transition still uses the global default.
    pub calibrated: bool,
}

#[derive(Debug)]
struct Slot {
    /// `f64` bits; NaN means "use the default".
    bits: AtomicU64,
    sample_count: AtomicU64,
    /// Milliseconds since the epoch, `NEVER` if never adjusted.
    adjusted_ms: AtomicI64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            bits: AtomicU64::new(f64::NAN.to_bits()),
            sample_count: AtomicU64::new(0),
            adjusted_ms: AtomicI64::new(NEVER),
        }
    }
}

/// Thread-safe threshold table.
#[derive(Debug)]
pub struct ThresholdStore {
    default_bits: AtomicU64,
    slots: [Slot; TRANSITION_SLOTS],
    write_lock: Mutex<()>,
}

impl Default for ThresholdStore {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

pub fn clamp_threshold(value: f64) -> f64 {
    value.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}

impl ThresholdStore {
    pub fn new(default_threshold: f64) -> Self {
        let default = if !default_threshold.is_finite() {
            DEFAULT_THRESHOLD
        } else {
            clamp_threshold(default_threshold)
        };
        Self {
            default_bits: AtomicU64::new(default.to_bits()),
            slots: std::array::from_fn(|_| Slot::empty()),
            write_lock: Mutex::new(()),
        }
    }

    /// Current threshold for a transition. Never blocks.
    pub fn get_threshold(&self, transition: Transition) -> f64 {
        let value = f64::from_bits(self.slots[transition.index()].bits.load(Ordering::Acquire));
        if value.is_nan() {
            self.default_threshold()
        } else {
            value
        }
    }

    pub fn default_threshold(&self) -> f64 {
        f64::from_bits(self.default_bits.load(Ordering::Acquire))
    }

    /// Replace the fallback used by uncalibrated transitions.
    pub fn set_default(&self, value: f64) -> Result<f64, ThresholdError> {
        if !value.is_finite() {
            return Err(ThresholdError::NonFinite(value));
        }
        let clamped = clamp_threshold(value);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.default_bits.store(clamped.to_bits(), Ordering::Release);
        Ok(clamped)
    }

    /// Manual override. Returns the value actually stored after clamping.
    pub fn set_threshold(&self, transition: Transition, value: f64) -> Result<f64, ThresholdError> {
        self.write(transition, value, 0, Utc::now())
    }

    /// Store a learner-computed threshold along with its evidence size.
    pub fn apply_calibration(
        &self,
        transition: Transition,
        value: f64,
        sample_count: u64,
        at: DateTime<Utc>,
    ) -> Result<f64, ThresholdError> {
        self.write(transition, value, sample_count, at)
    }

    fn write(
        &self,
        transition: Transition,
        value: f64,
        sample_count: u64,
        at: DateTime<Utc>,
    ) -> Result<f64, ThresholdError> {
        if transition.is_self_loop() {
            return Err(ThresholdError::SelfTransition(transition));
        }
        if !value.is_finite() {
            return Err(ThresholdError::NonFinite(value));
        }
        let clamped = clamp_threshold(value);
        let slot = &self.slots[transition.index()];

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        slot.sample_count.store(sample_count, Ordering::Relaxed);
        slot.adjusted_ms.store(at.timestamp_millis(), Ordering::Relaxed);
        slot.bits.store(clamped.to_bits(), Ordering::Release);

        debug!(%transition, requested = value, stored = clamped, "Threshold updated");
        Ok(clamped)
    }

    pub fn profile(&self, transition: Transition) -> ThresholdProfile {
        let slot = &self.slots[transition.index()];
        let raw = f64::from_bits(slot.bits.load(Ordering::Acquire));
        let adjusted_ms = slot.adjusted_ms.load(Ordering::Relaxed);
        ThresholdProfile {
            transition,
            confidence_threshold: if raw.is_nan() {
                self.default_threshold()
            } else {
                raw
            },
            sample_count: slot.sample_count.load(Ordering::Relaxed),
            last_adjusted_at: if adjusted_ms == NEVER {
                None
            } else {
                Utc.timestamp_millis_opt(adjusted_ms).single()
            },
            calibrated: !raw.is_nan(),
        }
    }

    /// Profiles for every valid transition.
    pub fn profiles(&self) -> Vec<ThresholdProfile> {
        Transition::all().map(|t| self.profile(t)).collect()
    }

    /// Reload calibrated values from a checkpoint. Uncalibrated profiles are
    /// skipped so the current default stays in effect for them.
    pub fn restore(&self, profiles: &[ThresholdProfile]) -> usize {
        let mut restored = 0;
        for profile in profiles.iter().filter(|p| p.calibrated) {
            let at = profile.last_adjusted_at.unwrap_or_else(Utc::now);
            if self
                .write(
                    profile.transition,
                    profile.confidence_threshold,
                    profile.sample_count,
                    at,
                )
                .is_ok()
            {
                restored += 1;
            }
        }
        restored
    }
}
