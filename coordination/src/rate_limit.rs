//! Per-conversation handoff rate limiting.
//!
//! Each conversation has an hourly and a daily fixed-window counter. The
//! check and the increment happen in one critical section per key, so two
//! concurrent evaluations can never both take the last slot of a window.
//!
//! A [`RatePermit`] remembers which windows it was counted against. When a
//! later gate declines the handoff the permit is refunded, so only approved
//! handoffs consume budget.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::state::StoreResult;
use crate::types::ConversationKey;

/// Window length for the hourly cap
pub fn hourly_window() -> Duration {
    Duration::hours(1)
}

/// Window length for the daily cap
pub fn daily_window() -> Duration {
    Duration::days(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCaps {
    pub hourly: u32,
    pub daily: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    Hourly,
    Daily,
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateWindow::Hourly => write!(f, "hourly"),
            RateWindow::Daily => write!(f, "daily"),
        }
    }
}

/// Fixed-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl WindowCounter {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Reset the counter if the window has elapsed.
    pub fn roll(&mut self, now: DateTime<Utc>, length: Duration) {
        if now - self.window_start >= length {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn refund(&mut self, window_start: DateTime<Utc>) {
        if self.window_start == window_start {
            self.count = self.count.saturating_sub(1);
        }
    }
}

/// Rate-limit state of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub hourly: WindowCounter,
    pub daily: WindowCounter,
}

impl RateLimitState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            hourly: WindowCounter::new(now),
            daily: WindowCounter::new(now),
        }
    }

    /// Roll both windows, then take a slot if both caps allow it.
    ///
    /// This is the whole check-and-increment; callers must run it while
    /// holding exclusive access to the state.
    pub fn try_take(
        &mut self,
        key: &ConversationKey,
        caps: RateCaps,
        now: DateTime<Utc>,
    ) -> RateLimitOutcome {
        self.hourly.roll(now, hourly_window());
        self.daily.roll(now, daily_window());

        if self.hourly.count >= caps.hourly {
            return RateLimitOutcome::Limited {
                window: RateWindow::Hourly,
                retry_at: self.hourly.window_start + hourly_window(),
            };
        }
        if self.daily.count >= caps.daily {
            return RateLimitOutcome::Limited {
                window: RateWindow::Daily,
                retry_at: self.daily.window_start + daily_window(),
            };
        }

        self.hourly.count += 1;
        self.daily.count += 1;
        RateLimitOutcome::Allowed(RatePermit {
            key: key.clone(),
            hourly_window_start: self.hourly.window_start,
            daily_window_start: self.daily.window_start,
        })
    }

    /// Give back a slot taken by `permit`. Windows that rolled over since
    /// the permit was issued are left alone.
    pub fn refund(&mut self, permit: &RatePermit) {
        self.hourly.refund(permit.hourly_window_start);
        self.daily.refund(permit.daily_window_start);
    }
}

/// Proof that one slot was taken in both windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePermit {
    pub key: ConversationKey,
    pub hourly_window_start: DateTime<Utc>,
    pub daily_window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed(RatePermit),
    Limited {
        window: RateWindow,
        retry_at: DateTime<Utc>,
    },
}

/// Storage for per-conversation rate-limit counters.
pub trait RateLimitStore: Send + Sync {
    /// Atomically check both caps and, if allowed, count one handoff.
    fn check_and_increment(
        &self,
        key: &ConversationKey,
        caps: RateCaps,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitOutcome>;

    /// Undo the increment made for `permit`.
    fn refund(&self, permit: &RatePermit) -> StoreResult<()>;

    fn state(&self, key: &ConversationKey) -> StoreResult<Option<RateLimitState>>;
}

pub type SharedRateLimitStore = Arc<dyn RateLimitStore>;

/// Sharded in-memory rate-limit counters.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    states: DashMap<ConversationKey, RateLimitState>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn check_and_increment(
        &self,
        key: &ConversationKey,
        caps: RateCaps,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitOutcome> {
        let mut state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| RateLimitState::new(now));
        Ok(state.try_take(key, caps, now))
    }

    fn refund(&self, permit: &RatePermit) -> StoreResult<()> {
        if let Some(mut state) = self.states.get_mut(&permit.key) {
            state.refund(permit);
        }
        Ok(())
    }

    fn state(&self, key: &ConversationKey) -> StoreResult<Option<RateLimitState>> {
        Ok(self.states.get(key).map(|s| *s))
    }
}
