//! Serde-loadable worker configuration.

use crate::retry::{MAX_ATTEMPTS, RetryPolicy};
use crate::storage::PriorityRange;
use crate::worker::{
    DEFAULT_BATCH_SIZE, DEFAULT_JITTER, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_MAX_RUN_TIME,
    DEFAULT_POLL_INTERVAL,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[serde_with::serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Controls how workers poll, lock and retry jobs.
///
/// Every field has a default, so an empty document is a valid configuration.
pub struct WorkerConfig {
    #[serde(default = "default_num_workers")]
    /// Number of workers started by a [`Runner`](crate::Runner).
    pub num_workers: usize,
    #[serde(default = "default_batch_size")]
    /// Jobs run per batch before throughput is reported.
    pub batch_size: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_poll_interval")]
    /// Idle time between polls of an empty queue.
    pub poll_interval: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(default = "default_jitter")]
    /// Maximum random extra idle time.
    pub jitter: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_max_run_time")]
    /// Locks older than this are considered abandoned and may be taken over.
    pub max_run_time: Duration,
    #[serde(default)]
    /// Only run jobs with `priority >= min_priority`.
    pub min_priority: Option<i32>,
    #[serde(default)]
    /// Only run jobs with `priority < max_priority`.
    pub max_priority: Option<i32>,
    #[serde(default = "default_max_attempts")]
    /// Attempts before a failing job is abandoned.
    pub max_attempts: i32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_min_backoff")]
    /// Delay before the first retry.
    pub min_backoff: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_max_backoff")]
    /// Upper bound of the exponential retry delay.
    pub max_backoff: Duration,
    #[serde(default = "default_backoff_jitter_pct")]
    /// Percentage of random extra retry delay.
    pub backoff_jitter_pct: u8,
    #[serde(default = "default_true")]
    /// Delete abandoned jobs instead of marking them failed.
    pub destroy_failed_jobs: bool,
    #[serde(default)]
    /// Keep successful jobs, marked completed.
    pub retain_completed_jobs: bool,
    #[serde(default = "default_max_consecutive_failures")]
    /// Consecutive store failures a worker tolerates before stopping.
    pub max_consecutive_failures: u32,
    #[serde(default)]
    /// Stop workers as soon as the queue is empty.
    pub shutdown_when_queue_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
            jitter: default_jitter(),
            max_run_time: default_max_run_time(),
            min_priority: None,
            max_priority: None,
            max_attempts: default_max_attempts(),
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            backoff_jitter_pct: default_backoff_jitter_pct(),
            destroy_failed_jobs: true,
            retain_completed_jobs: false,
            max_consecutive_failures: default_max_consecutive_failures(),
            shutdown_when_queue_empty: false,
        }
    }
}

impl WorkerConfig {
    /// The configured priority bounds.
    pub fn priority_range(&self) -> PriorityRange {
        PriorityRange::new(self.min_priority, self.max_priority)
    }

    /// The configured retry behaviour.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            backoff_jitter_pct: self.backoff_jitter_pct,
        }
    }

    pub(crate) fn set_priority_range(&mut self, priorities: PriorityRange) {
        self.min_priority = priorities.min;
        self.max_priority = priorities.max;
    }

    pub(crate) fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.max_attempts = policy.max_attempts;
        self.min_backoff = policy.min_backoff;
        self.max_backoff = policy.max_backoff;
        self.backoff_jitter_pct = policy.backoff_jitter_pct;
    }
}

fn default_num_workers() -> usize {
    1
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_jitter() -> Duration {
    DEFAULT_JITTER
}

fn default_max_run_time() -> Duration {
    DEFAULT_MAX_RUN_TIME
}

fn default_max_attempts() -> i32 {
    MAX_ATTEMPTS
}

fn default_min_backoff() -> Duration {
    RetryPolicy::default().min_backoff
}

fn default_max_backoff() -> Duration {
    RetryPolicy::default().max_backoff
}

fn default_backoff_jitter_pct() -> u8 {
    RetryPolicy::default().backoff_jitter_pct
}

fn default_true() -> bool {
    true
}

fn default_max_consecutive_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}
