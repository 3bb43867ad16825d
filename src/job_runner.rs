use crate::codec::{Payload, PayloadCodec};
use crate::errors::{JobFailure, StoreError};
use crate::retry::RetryPolicy;
use crate::schema::{JobId, JobRecord};
use crate::storage::Storage;
use crate::store::JobStore;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use chrono::Utc;
use futures_util::FutureExt;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

/// What happened to a candidate handed to [`JobRunner::lock_and_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another worker holds the lock; nothing was done.
    Skipped,
    /// The job ran and was removed (or marked completed).
    Succeeded,
    /// The job failed and will be retried later.
    Rescheduled,
    /// The job failed for good and was removed (or marked failed).
    PermanentlyFailed,
}

/// Locks, runs and settles single jobs.
pub struct JobRunner<S, Context> {
    store: JobStore<S>,
    codec: Arc<PayloadCodec<Context>>,
    context: Context,
    retry_policy: RetryPolicy,
    destroy_failed_jobs: bool,
    retain_completed_jobs: bool,
}

impl<S, Context: std::fmt::Debug> std::fmt::Debug for JobRunner<S, Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("codec", &self.codec)
            .field("context", &self.context)
            .field("retry_policy", &self.retry_policy)
            .field("destroy_failed_jobs", &self.destroy_failed_jobs)
            .field("retain_completed_jobs", &self.retain_completed_jobs)
            .finish_non_exhaustive()
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static> JobRunner<S, Context> {
    /// Create a runner that deletes finished jobs and retries with the default policy.
    pub fn new(store: JobStore<S>, codec: Arc<PayloadCodec<Context>>, context: Context) -> Self {
        Self {
            store,
            codec,
            context,
            retry_policy: RetryPolicy::default(),
            destroy_failed_jobs: true,
            retain_completed_jobs: false,
        }
    }

    /// Set how failed jobs are retried.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Delete abandoned jobs (`true`) or keep them with `failed_at` set (`false`).
    pub fn destroy_failed_jobs(mut self, destroy: bool) -> Self {
        self.destroy_failed_jobs = destroy;
        self
    }

    /// Keep successful jobs with `completed_at` set instead of deleting them.
    pub fn retain_completed_jobs(mut self, retain: bool) -> Self {
        self.retain_completed_jobs = retain;
        self
    }

    /// The store jobs are settled in.
    pub fn store(&self) -> &JobStore<S> {
        &self.store
    }

    /// Lock `record` for `worker`, run it, and record the result.
    ///
    /// Lock contention is not an error and yields [`JobOutcome::Skipped`].
    /// Only store failures are returned as errors.
    pub async fn lock_and_run(
        &self,
        record: &JobRecord,
        max_run_time: Duration,
        worker: &str,
    ) -> Result<JobOutcome, StoreError> {
        if !self.store.lock_exclusively(record, worker, max_run_time).await? {
            warn!(
                job.id = record.id,
                "Failed to acquire exclusive lock; another worker is running the job"
            );
            return Ok(JobOutcome::Skipped);
        }

        let span = info_span!(
            "job",
            job.id = record.id,
            job.type = field::Empty,
            job.attempts = record.attempts
        );

        self.settle(record).instrument(span).await
    }

    async fn settle(&self, record: &JobRecord) -> Result<JobOutcome, StoreError> {
        let payload = match self.codec.deserialize(&record.handler) {
            Ok(payload) => payload,
            Err(error) => {
                return self
                    .handle_failure(record, "<unloadable job>", error.into())
                    .await;
            }
        };

        let name = payload.display_name();
        Span::current().record("job.type", payload.job_type());
        debug!("Running job…");

        let started = Instant::now();
        match self.execute(&payload).await {
            Ok(()) => {
                self.finish(record.id).await?;
                info!(
                    duration = ?started.elapsed(),
                    "{name} completed after {:.4}s",
                    started.elapsed().as_secs_f64()
                );
                Ok(JobOutcome::Succeeded)
            }
            Err(error) => {
                self.handle_failure(record, &name, JobFailure::Execution(error))
                    .await
            }
        }
    }

    async fn execute(&self, payload: &Payload<Context>) -> anyhow::Result<()> {
        let future = with_sentry_transaction(payload.job_type(), async {
            AssertUnwindSafe(payload.run(self.context.clone()))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                .and_then(std::convert::identity)
        });

        future.bind_hub(Hub::current()).await
    }

    async fn finish(&self, id: JobId) -> Result<(), StoreError> {
        if self.retain_completed_jobs {
            debug!("Marking successful job as completed…");
            self.store.mark_completed(id).await
        } else {
            debug!("Deleting successful job…");
            self.store.delete(id).await
        }
    }

    async fn handle_failure(
        &self,
        record: &JobRecord,
        name: &str,
        failure: JobFailure,
    ) -> Result<JobOutcome, StoreError> {
        let attempts = record.attempts + 1;
        match failure {
            JobFailure::Payload(error) => {
                error!(%error, "{name} failed to load and will not be retried");
                self.abandon(record.id, &error.to_string()).await?;
                Ok(JobOutcome::PermanentlyFailed)
            }
            JobFailure::Execution(error) if self.retry_policy.should_retry(record.attempts) => {
                let run_at = self.retry_policy.next_run_at(Utc::now(), record.attempts);
                let message = format!("{error:#}");
                warn!(%run_at, "{name} failed with {message} - {attempts} failed attempts");
                self.store.reschedule(record.id, run_at, &message).await?;
                Ok(JobOutcome::Rescheduled)
            }
            JobFailure::Execution(error) => {
                error!("{name} failed permanently with {error:#} - {attempts} failed attempts");
                self.abandon(record.id, &format!("{error:#}")).await?;
                Ok(JobOutcome::PermanentlyFailed)
            }
        }
    }

    async fn abandon(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        if self.destroy_failed_jobs {
            self.store.delete(id).await
        } else {
            self.store.mark_failed(id, error).await
        }
    }
}
