use crate::policy::Policy;
use crate::time::{millis, now_ms};
use mailswarm_api::PollTarget;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait PollDelay: Send + Sync {
    fn next_delay(&self, target: &PollTarget, failure_count: u32) -> Duration;
}

pub struct FixedDelay {
    interval_ms: u64,
}

impl FixedDelay {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms }
    }
}

impl PollDelay for FixedDelay {
    fn next_delay(&self, _target: &PollTarget, _failure_count: u32) -> Duration {
        millis(self.interval_ms)
    }
}

pub trait ActivitySource: Send + Sync {
    fn last_activity_ms(&self, target: &PollTarget) -> Option<u64>;
}

#[derive(Clone, Default)]
pub struct ActivityTracker {
    seen: Arc<Mutex<HashMap<PollTarget, u64>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, target: &PollTarget, timestamp_ms: u64) {
        if let Ok(mut guard) = self.seen.lock() {
            let entry = guard.entry(target.clone()).or_insert(0);
            *entry = (*entry).max(timestamp_ms);
        }
    }
}

impl ActivitySource for ActivityTracker {
    fn last_activity_ms(&self, target: &PollTarget) -> Option<u64> {
        self.seen.lock().ok().and_then(|guard| guard.get(target).copied())
    }
}

/// Polls fast while a target is active and slows down linearly to the
/// maximum interval over the activity window. Consecutive failures add an
/// exponential back-off, still capped at the maximum interval.
pub struct ActivityDelay {
    min_ms: u64,
    max_ms: u64,
    window_ms: u64,
    failure_backoff_ms: u64,
    source: Arc<dyn ActivitySource>,
}

impl ActivityDelay {
    pub fn new(policy: &Policy, source: Arc<dyn ActivitySource>) -> Self {
        let min_ms = policy.min_poll_interval_ms;
        Self {
            min_ms,
            max_ms: policy.max_poll_interval_ms.max(min_ms),
            window_ms: policy.activity_window_ms,
            failure_backoff_ms: policy.failure_backoff_ms,
            source,
        }
    }

    fn interpolated_ms(&self, target: &PollTarget, now: u64) -> u64 {
        let Some(last) = self.source.last_activity_ms(target) else {
            return self.max_ms;
        };
        if self.window_ms == 0 {
            return self.max_ms;
        }
        let idle = now.saturating_sub(last).min(self.window_ms);
        let span = self.max_ms - self.min_ms;
        let extra = (span as u128 * idle as u128 / self.window_ms as u128) as u64;
        self.min_ms + extra
    }
}

impl PollDelay for ActivityDelay {
    fn next_delay(&self, target: &PollTarget, failure_count: u32) -> Duration {
        let base = self.interpolated_ms(target, now_ms());
        let backoff = if failure_count == 0 {
            0
        } else {
            let factor = 1u64 << (failure_count.saturating_sub(1).min(16));
            self.failure_backoff_ms.saturating_mul(factor)
        };
        millis(base.saturating_add(backoff).min(self.max_ms))
    }
}
