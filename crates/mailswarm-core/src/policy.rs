use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Policy {
    pub min_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub activity_window_ms: u64,
    pub failure_backoff_ms: u64,
    /// Zero keeps the poller retrying forever.
    pub max_failures_before_stop: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_job_failures: u32,
    pub job_batch: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: 3_000,
            max_poll_interval_ms: 30_000,
            activity_window_ms: 12 * 60 * 60 * 1000,
            failure_backoff_ms: 1_000,
            max_failures_before_stop: 0,
            backoff_initial_ms: 500,
            backoff_max_ms: 60_000,
            max_job_failures: 10,
            job_batch: 32,
        }
    }
}
