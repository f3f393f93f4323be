//! Coordination configuration
//!
//! Every tunable of the handoff layer lives in [`CoordinationConfig`]. Values
//! come from defaults, a TOML file, or `HANDOFF_*` environment variables, and
//! are published to running components through a [`ConfigHandle`] so caps,
//! windows and SLA targets can be changed without a restart.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `HANDOFF_HOURLY_CAP` | `3` | Handoffs allowed per conversation per hour |
//! | `HANDOFF_DAILY_CAP` | `10` | Handoffs allowed per conversation per day |
//! | `HANDOFF_CIRCULAR_WINDOW_SECS` | `1800` | Cycle-prevention window |
//! | `HANDOFF_SLA_LEAD_MS` / `_BUYER_MS` / `_SELLER_MS` | `2000` / `2500` / `2500` | Per-agent p95 latency target |
//! | `HANDOFF_MIN_SAMPLES` | `10` | Outcomes required before a transition is recalibrated |
//! | `HANDOFF_DEFAULT_THRESHOLD` | `0.7` | Threshold for uncalibrated transitions |
//! | `HANDOFF_LOCK_TTL_SECS` | `120` | Per-conversation lease length |
//! | `HANDOFF_BACKOFF_SECS` | `300` | Retry hint when the target is degraded |
//! | `HANDOFF_COLD_START_POLICY` | `assume_healthy` | Health verdict with no samples |
//! | `HANDOFF_SAMPLE_CAPACITY` | `200` | Ring buffer size per agent |
//! | `HANDOFF_SAMPLE_WINDOW_SECS` | `300` | Rolling window for percentiles |
//! | `HANDOFF_SWEEP_INTERVAL_SECS` | `15` | Lease sweeper tick |
//! | `HANDOFF_CALIBRATION_INTERVAL_SECS` | `3600` | Threshold recalibration tick |
//! | `HANDOFF_CALIBRATION_PRIOR_WEIGHT` | `5.0` | Pull toward the current threshold |
//! | `HANDOFF_MAX_OUTCOMES` | `500` | Outcome log cap per transition |
//!
//! Unparseable values fall back to the default with a warning.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::types::AgentType;

pub const DEFAULT_HOURLY_CAP: u32 = 3;
pub const DEFAULT_DAILY_CAP: u32 = 10;
pub const DEFAULT_CIRCULAR_WINDOW_SECS: u64 = 30 * 60;
pub const DEFAULT_MIN_SAMPLES: usize = 10;
pub const DEFAULT_THRESHOLD: f64 = 0.7;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 120;
pub const DEFAULT_BACKOFF_SECS: u64 = 300;
/// Upper bound for every `*_secs` setting (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// p95 latency target per agent, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaTargets {
    pub lead: u64,
    pub buyer: u64,
    pub seller: u64,
}

impl Default for SlaTargets {
    fn default() -> Self {
        Self {
            lead: 2000,
            buyer: 2500,
            seller: 2500,
        }
    }
}

impl SlaTargets {
    pub fn get(&self, agent: AgentType) -> u64 {
        match agent {
            AgentType::Lead => self.lead,
            AgentType::Buyer => self.buyer,
            AgentType::Seller => self.seller,
        }
    }

    pub fn set(&mut self, agent: AgentType, target_ms: u64) {
        match agent {
            AgentType::Lead => self.lead = target_ms,
            AgentType::Buyer => self.buyer = target_ms,
            AgentType::Seller => self.seller = target_ms,
        }
    }
}

/// Health verdict for an agent that has no samples in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStartPolicy {
    AssumeHealthy,
    AssumeDegraded,
}

impl FromStr for ColdStartPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assume_healthy" | "healthy" => Ok(Self::AssumeHealthy),
            "assume_degraded" | "degraded" => Ok(Self::AssumeDegraded),
            other => Err(ConfigError::InvalidValue {
                field: "cold_start_policy",
                reason: format!("unknown policy '{other}'"),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// All tunables of the coordination layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub hourly_cap: u32,
    pub daily_cap: u32,
    pub circular_window_secs: u64,
    pub sla_target_ms: SlaTargets,
    pub min_samples_for_calibration: usize,
    pub default_threshold: f64,
    pub lock_ttl_secs: u64,
    pub backoff_secs: u64,
    pub cold_start_policy: ColdStartPolicy,
    pub sample_capacity: usize,
    pub sample_window_secs: u64,
    pub sweep_interval_secs: u64,
    pub calibration_interval_secs: u64,
    pub calibration_prior_weight: f64,
    pub max_outcomes_per_transition: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            hourly_cap: DEFAULT_HOURLY_CAP,
            daily_cap: DEFAULT_DAILY_CAP,
            circular_window_secs: DEFAULT_CIRCULAR_WINDOW_SECS,
            sla_target_ms: SlaTargets::default(),
            min_samples_for_calibration: DEFAULT_MIN_SAMPLES,
            default_threshold: DEFAULT_THRESHOLD,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            backoff_secs: DEFAULT_BACKOFF_SECS,
            cold_start_policy: ColdStartPolicy::AssumeHealthy,
            sample_capacity: 200,
            sample_window_secs: 300,
            sweep_interval_secs: 15,
            calibration_interval_secs: 3600,
            calibration_prior_weight: 5.0,
            max_outcomes_per_transition: 500,
        }
    }
}

impl CoordinationConfig {
    /// Defaults overridden by any `HANDOFF_*` environment variables.
    pub fn from_env() -> Self {
        let base = Self::default();
        let mut sla_target_ms = base.sla_target_ms;
        for &agent in AgentType::all() {
            let var = format!("HANDOFF_SLA_{}_MS", agent.as_str().to_ascii_uppercase());
            sla_target_ms.set(agent, env_or(&var, base.sla_target_ms(agent)));
        }
        Self {
            hourly_cap: env_or("HANDOFF_HOURLY_CAP", base.hourly_cap),
            daily_cap: env_or("HANDOFF_DAILY_CAP", base.daily_cap),
            circular_window_secs: env_or("HANDOFF_CIRCULAR_WINDOW_SECS", base.circular_window_secs),
            sla_target_ms,
            min_samples_for_calibration: env_or(
                "HANDOFF_MIN_SAMPLES",
                base.min_samples_for_calibration,
            ),
            default_threshold: env_or("HANDOFF_DEFAULT_THRESHOLD", base.default_threshold),
            lock_ttl_secs: env_or("HANDOFF_LOCK_TTL_SECS", base.lock_ttl_secs),
            backoff_secs: env_or("HANDOFF_BACKOFF_SECS", base.backoff_secs),
            cold_start_policy: env_or("HANDOFF_COLD_START_POLICY", base.cold_start_policy),
            sample_capacity: env_or("HANDOFF_SAMPLE_CAPACITY", base.sample_capacity),
            sample_window_secs: env_or("HANDOFF_SAMPLE_WINDOW_SECS", base.sample_window_secs),
            sweep_interval_secs: env_or("HANDOFF_SWEEP_INTERVAL_SECS", base.sweep_interval_secs),
            calibration_interval_secs: env_or(
                "HANDOFF_CALIBRATION_INTERVAL_SECS",
                base.calibration_interval_secs,
            ),
            calibration_prior_weight: env_or(
                "HANDOFF_CALIBRATION_PRIOR_WEIGHT",
                base.calibration_prior_weight,
            ),
            max_outcomes_per_transition: env_or(
                "HANDOFF_MAX_OUTCOMES",
                base.max_outcomes_per_transition,
            ),
        }
    }

    /// Parse and validate a TOML document. Missing keys take defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            field: "config",
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
            Ok(())
        }

        fn bounded(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value > MAX_DURATION_SECS {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{value}s exceeds the maximum of {MAX_DURATION_SECS}s"),
                });
            }
            Ok(())
        }

        if self.daily_cap < self.hourly_cap {
            return Err(ConfigError::InvalidValue {
                field: "daily_cap",
                reason: format!(
                    "daily cap {} is below hourly cap {}",
                    self.daily_cap, self.hourly_cap
                ),
            });
        }
        if !self.default_threshold.is_finite() || !(0.0..=1.0).contains(&self.default_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "default_threshold",
                reason: format!("{} is not in [0, 1]", self.default_threshold),
            });
        }
        if !self.calibration_prior_weight.is_finite() || self.calibration_prior_weight < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "calibration_prior_weight",
                reason: format!("{} must be a non-negative number", self.calibration_prior_weight),
            });
        }
        positive("lock_ttl_secs", self.lock_ttl_secs)?;
        positive("sample_capacity", self.sample_capacity as u64)?;
        positive("sample_window_secs", self.sample_window_secs)?;
        positive("sweep_interval_secs", self.sweep_interval_secs)?;
        positive("calibration_interval_secs", self.calibration_interval_secs)?;
        positive("min_samples_for_calibration", self.min_samples_for_calibration as u64)?;
        positive("max_outcomes_per_transition", self.max_outcomes_per_transition as u64)?;
        bounded("circular_window_secs", self.circular_window_secs)?;
        bounded("lock_ttl_secs", self.lock_ttl_secs)?;
        bounded("backoff_secs", self.backoff_secs)?;
        bounded("sample_window_secs", self.sample_window_secs)?;
        bounded("sweep_interval_secs", self.sweep_interval_secs)?;
        bounded("calibration_interval_secs", self.calibration_interval_secs)?;
        for &agent in AgentType::all() {
            if self.sla_target_ms.get(agent) == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "sla_target_ms",
                    reason: format!("target for {agent} must be greater than zero"),
                });
            }
        }
        Ok(())
    }

    pub fn sla_target_ms(&self, agent: AgentType) -> u64 {
        self.sla_target_ms.get(agent)
    }

    pub fn circular_window(&self) -> chrono::Duration {
        secs(self.circular_window_secs)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        secs(self.lock_ttl_secs)
    }

    pub fn backoff(&self) -> chrono::Duration {
        secs(self.backoff_secs)
    }

    pub fn sample_window(&self) -> chrono::Duration {
        secs(self.sample_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn calibration_interval(&self) -> Duration {
        Duration::from_secs(self.calibration_interval_secs)
    }
}

/// Saturates at [`MAX_DURATION_SECS`] so an unvalidated config cannot panic.
fn secs(value: u64) -> chrono::Duration {
    let clamped = value.min(MAX_DURATION_SECS) as i64;
    chrono::Duration::try_seconds(clamped).unwrap_or_else(chrono::Duration::zero)
}

fn env_or<T: FromStr + std::fmt::Debug>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, ?default, "Unparseable config override, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Live view of the configuration shared by all components.
///
/// Readers take a cheap snapshot with [`ConfigHandle::current`]; an update
/// is visible to the next decision without restarting anything.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<CoordinationConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: CoordinationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, _rx) = watch::channel(Arc::new(config));
        Ok(Self { tx: Arc::new(tx) })
    }

    pub fn current(&self) -> Arc<CoordinationConfig> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CoordinationConfig>> {
        self.tx.subscribe()
    }

    /// Validate and publish a new configuration.
    pub fn update(&self, config: CoordinationConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }
}
