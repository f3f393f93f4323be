//! Agent health tracking.
//!
//! Keeps a bounded ring of recent `(latency, success)` samples per agent and
//! turns them into a rolling snapshot. An agent is degraded when its p95
//! latency exceeds 1.2x its SLA target or more than 10% of recent requests
//! failed. With no samples in the window, the configured cold-start policy
//! decides.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::{ColdStartPolicy, ConfigHandle};
use crate::types::AgentType;

/// p95 above `sla * DEGRADED_LATENCY_FACTOR` marks an agent degraded.
pub const DEGRADED_LATENCY_FACTOR: f64 = 1.2;
/// Error rate above this marks an agent degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub latency_ms: u64,
    pub succeeded: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Rolling health metrics of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformanceSnapshot {
    pub agent: AgentType,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub error_rate: f64,
    pub sample_count: usize,
    pub window_end: DateTime<Utc>,
}

impl AgentPerformanceSnapshot {
    fn empty(agent: AgentType, window_end: DateTime<Utc>) -> Self {
        Self {
            agent,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            error_rate: 0.0,
            sample_count: 0,
            window_end,
        }
    }

    fn from_samples(
        agent: AgentType,
        samples: &[PerformanceSample],
        window_end: DateTime<Utc>,
    ) -> Self {
        if samples.is_empty() {
            return Self::empty(agent, window_end);
        }
        let mut latencies: Vec<u64> = samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();
        let failures = samples.iter().filter(|s| !s.succeeded).count();
        Self {
            agent,
            p50_ms: percentile(&latencies, 50),
            p95_ms: percentile(&latencies, 95),
            p99_ms: percentile(&latencies, 99),
            error_rate: failures as f64 / samples.len() as f64,
            sample_count: samples.len(),
            window_end,
        }
    }

    /// Degradation verdict against an SLA target. Empty snapshots are not
    /// degraded; the cold-start policy is applied by the monitor.
    pub fn exceeds(&self, sla_target_ms: u64) -> bool {
        if self.sample_count == 0 {
            return false;
        }
        self.p95_ms as f64 > sla_target_ms as f64 * DEGRADED_LATENCY_FACTOR
            || self.error_rate > DEGRADED_ERROR_RATE
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[u64], p: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Storage for per-agent sample rings.
pub trait PerformanceStore: Send + Sync {
    /// Append a sample, evicting the oldest beyond `capacity`.
    fn push(&self, agent: AgentType, sample: PerformanceSample, capacity: usize);

    /// Samples recorded at or after `since`, oldest first.
    fn recent(&self, agent: AgentType, since: DateTime<Utc>) -> Vec<PerformanceSample>;
}

#[derive(Debug, Default)]
pub struct MemoryPerformanceStore {
    rings: DashMap<AgentType, VecDeque<PerformanceSample>>,
}

impl MemoryPerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PerformanceStore for MemoryPerformanceStore {
    fn push(&self, agent: AgentType, sample: PerformanceSample, capacity: usize) {
        let mut ring = self.rings.entry(agent).or_default();
        ring.push_back(sample);
        while ring.len() > capacity.max(1) {
            ring.pop_front();
        }
    }

    fn recent(&self, agent: AgentType, since: DateTime<Utc>) -> Vec<PerformanceSample> {
        self.rings
            .get(&agent)
            .map(|ring| {
                ring.iter()
                    .filter(|s| s.recorded_at >= since)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Health monitor queried by the decision engine.
#[derive(Clone)]
pub struct AgentPerformanceMonitor {
    store: Arc<dyn PerformanceStore>,
    config: ConfigHandle,
    clock: SharedClock,
}

impl std::fmt::Debug for AgentPerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPerformanceMonitor")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl AgentPerformanceMonitor {
    pub fn new(store: Arc<dyn PerformanceStore>, config: ConfigHandle, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn record_sample(&self, agent: AgentType, latency_ms: u64, succeeded: bool) {
        let capacity = self.config.current().sample_capacity;
        let sample = PerformanceSample {
            latency_ms,
            succeeded,
            recorded_at: self.clock.now(),
        };
        self.store.push(agent, sample, capacity);
    }

    pub fn snapshot(&self, agent: AgentType) -> AgentPerformanceSnapshot {
        let now = self.clock.now();
        let since = now - self.config.current().sample_window();
        let samples = self.store.recent(agent, since);
        AgentPerformanceSnapshot::from_samples(agent, &samples, now)
    }

    pub fn snapshots(&self) -> Vec<AgentPerformanceSnapshot> {
        AgentType::all().iter().map(|a| self.snapshot(*a)).collect()
    }

    pub fn is_degraded(&self, agent: AgentType, sla_target_ms: u64) -> bool {
        let snapshot = self.snapshot(agent);
        if snapshot.sample_count == 0 {
            let degraded =
                self.config.current().cold_start_policy == ColdStartPolicy::AssumeDegraded;
            debug!(%agent, degraded, "No samples in window, applying cold-start policy");
            return degraded;
        }
        snapshot.exceeds(sla_target_ms)
    }
}
