use crate::errors::StoreError;
use crate::job_runner::{JobOutcome, JobRunner};
use crate::storage::{PriorityRange, Storage};
use rand::Rng;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Candidates fetched per reservation attempt.
const RESERVATION_LIMIT: usize = 5;

pub(crate) const DEFAULT_BATCH_SIZE: u32 = 100;
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_JITTER: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);
pub(crate) const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Jobs processed by one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkSummary {
    /// Jobs that ran successfully.
    pub success: u32,
    /// Jobs that failed, whether rescheduled or abandoned.
    pub failure: u32,
}

impl WorkSummary {
    /// Number of jobs that ran.
    pub fn total(&self) -> u32 {
        self.success + self.failure
    }
}

/// A polling loop that reserves and runs jobs under one worker identity.
pub struct Worker<S, Context> {
    name: String,
    runner: JobRunner<S, Context>,
    shutdown: watch::Receiver<bool>,
    priorities: PriorityRange,
    max_run_time: Duration,
    batch_size: u32,
    poll_interval: Duration,
    jitter: Duration,
    max_consecutive_failures: u32,
    shutdown_when_queue_empty: bool,
}

impl<S, Context: std::fmt::Debug> std::fmt::Debug for Worker<S, Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("runner", &self.runner)
            .field("priorities", &self.priorities)
            .field("max_run_time", &self.max_run_time)
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static> Worker<S, Context> {
    /// Create a worker named `name`.
    ///
    /// The worker stops once `true` is sent through the channel behind
    /// `shutdown`.
    pub fn new(
        name: impl Into<String>,
        runner: JobRunner<S, Context>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.into(),
            runner,
            shutdown,
            priorities: PriorityRange::default(),
            max_run_time: DEFAULT_MAX_RUN_TIME,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            shutdown_when_queue_empty: false,
        }
    }

    /// Only pick up jobs within `priorities`.
    pub fn priority_range(mut self, priorities: PriorityRange) -> Self {
        self.priorities = priorities;
        self
    }

    /// Locks older than this are considered abandoned.
    pub fn max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    /// Jobs run per batch by [`Self::run`].
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Idle time between polls of an empty queue.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Maximum random extra idle time.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Consecutive store failures tolerated before [`Self::run`] gives up.
    pub fn max_consecutive_failures(mut self, max_consecutive_failures: u32) -> Self {
        self.max_consecutive_failures = max_consecutive_failures;
        self
    }

    /// Return from [`Self::run`] as soon as a batch finds nothing to do.
    pub fn shutdown_when_queue_empty(mut self, shutdown_when_queue_empty: bool) -> Self {
        self.shutdown_when_queue_empty = shutdown_when_queue_empty;
        self
    }

    /// The identity used for locks.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Sleep for `duration`, waking up early when shutdown is requested.
    async fn pause(&self, duration: Duration) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = sleep(duration) => {}
            Ok(()) = shutdown.changed() => {}
        }
    }

    /// Run the first candidate this worker manages to lock.
    ///
    /// Returns `None` if there was nothing to run, or every candidate was
    /// locked by another worker.
    pub async fn reserve_and_run_one_job(&self) -> Result<Option<JobOutcome>, StoreError> {
        trace!("Looking for next background job…");
        let candidates = self
            .runner
            .store()
            .find_available(RESERVATION_LIMIT, self.priorities, self.max_run_time, &self.name)
            .await?;

        for candidate in &candidates {
            match self.runner.lock_and_run(candidate, self.max_run_time, &self.name).await? {
                JobOutcome::Skipped => continue,
                outcome => return Ok(Some(outcome)),
            }
        }

        Ok(None)
    }

    /// Run up to `batch_size` jobs, stopping early when the queue is empty
    /// or shutdown was requested.
    pub async fn run_batch(&self, batch_size: u32) -> Result<WorkSummary, StoreError> {
        let mut summary = WorkSummary::default();
        for _ in 0..batch_size {
            if self.shutdown_requested() {
                break;
            }

            match self.reserve_and_run_one_job().await? {
                None => break,
                Some(JobOutcome::Succeeded) => summary.success += 1,
                Some(JobOutcome::Rescheduled | JobOutcome::PermanentlyFailed) => {
                    summary.failure += 1;
                }
                Some(JobOutcome::Skipped) => {}
            }
        }
        Ok(summary)
    }

    /// Process batches until shutdown is requested.
    ///
    /// Store failures are retried with a growing delay. Once more than
    /// `max_consecutive_failures` happen in a row the last error is returned.
    #[allow(clippy::cognitive_complexity)]
    pub async fn run(&self) -> Result<(), StoreError> {
        let mut failures = 0_u32;

        let result = loop {
            if self.shutdown_requested() {
                debug!("Shutdown requested. Stopping the worker…");
                break Ok(());
            }

            let started = Instant::now();
            match self.run_batch(self.batch_size).await {
                Ok(summary) if summary.total() == 0 => {
                    failures = 0;
                    if self.shutdown_when_queue_empty {
                        debug!("No pending background jobs found. Shutting down the worker…");
                        break Ok(());
                    }

                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!(
                        "No pending background jobs found. Polling again in {sleep_duration:?}…"
                    );
                    self.pause(sleep_duration).await;
                }
                Ok(summary) => {
                    failures = 0;
                    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                    let rate = f64::from(summary.total()) / elapsed;
                    info!(
                        "{} jobs processed at {rate:.4} j/s, {} failed",
                        summary.total(),
                        summary.failure
                    );
                }
                Err(error) => {
                    failures += 1;
                    if failures > self.max_consecutive_failures {
                        error!(%error, "Giving up after {failures} consecutive store failures");
                        break Err(error);
                    }

                    let backoff = Duration::from_millis(50 << failures.min(10));
                    error!(%error, "Failed to run jobs. Retrying in {backoff:?}…");
                    self.pause(backoff).await;
                }
            }
        };

        self.release_locks().await;
        result
    }

    async fn release_locks(&self) {
        match self.runner.store().release_locks(&self.name).await {
            Ok(0) => {}
            Ok(released) => debug!("Released {released} locks"),
            Err(error) => warn!(%error, "Failed to release locks"),
        }
    }
}
