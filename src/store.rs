use crate::BackgroundJob;
use crate::codec;
use crate::errors::{EnqueueError, StoreError};
use crate::schema::{JobId, JobRecord, NewJob};
use crate::storage::{JobFilter, JobPatch, LockCondition, PriorityRange, Storage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// The instant before which a lock counts as stale.
pub(crate) fn stale_before(now: DateTime<Utc>, max_run_time: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(max_run_time)
        .ok()
        .and_then(|max_run_time| now.checked_sub_signed(max_run_time))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Queue operations on top of a [`Storage`].
///
/// Cloning is cheap; all clones share the same storage.
#[derive(Debug)]
pub struct JobStore<S> {
    storage: Arc<S>,
}

impl<S> Clone for JobStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<S: Storage> JobStore<S> {
    /// Wrap a storage adapter.
    pub fn new(storage: S) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }

    /// The underlying storage adapter.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Persist a new job that becomes runnable at `run_at`.
    ///
    /// Nothing is written if the job cannot be serialized into a loadable
    /// handler.
    #[instrument(
        name = "delayed_job.store.enqueue",
        skip(self, job),
        fields(job.type = J::JOB_NAME)
    )]
    pub async fn enqueue<J: BackgroundJob>(
        &self,
        job: &J,
        priority: i32,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, EnqueueError> {
        let handler = codec::serialize(job)?;
        let id = self
            .storage
            .insert(NewJob {
                handler,
                priority,
                run_at,
            })
            .await?;

        debug!(job.id = id, "Enqueued job");
        Ok(id)
    }

    /// Jobs that are ready to run and could be locked by `worker`.
    ///
    /// This does not lock anything; the result is only a list of candidates.
    #[instrument(name = "delayed_job.store.find_available", level = "trace", skip(self))]
    pub async fn find_available(
        &self,
        limit: usize,
        priorities: PriorityRange,
        max_run_time: Duration,
        worker: &str,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let now = Utc::now();
        let filter = JobFilter {
            ready_at: now,
            priorities,
            stale_before: stale_before(now, max_run_time),
            worker: worker.to_string(),
        };
        self.storage.find_matching(&filter, limit).await
    }

    /// Try to take the execution lock of `candidate` for `worker`.
    ///
    /// Succeeds if the job is unlocked, already locked by `worker`, or
    /// locked longer than `max_run_time` ago, and has not been retried or
    /// finished since `candidate` was read. Returns `false` without side
    /// effects otherwise.
    #[instrument(
        name = "delayed_job.store.lock",
        level = "debug",
        skip(self, candidate),
        fields(job.id = candidate.id)
    )]
    pub async fn lock_exclusively(
        &self,
        candidate: &JobRecord,
        worker: &str,
        max_run_time: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let condition = LockCondition {
            worker: worker.to_string(),
            stale_before: stale_before(now, max_run_time),
            expected_attempts: candidate.attempts,
        };
        self.storage.try_lock(candidate.id, &condition, now).await
    }

    /// Remove a job. Deleting a missing job is not an error.
    pub async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.storage.delete(id).await?;
        Ok(())
    }

    /// Count a failed attempt, push the job to `next_run_at` (never
    /// earlier than its current `run_at`) and release the lock.
    pub async fn reschedule(
        &self,
        id: JobId,
        next_run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let patch = JobPatch::Reschedule {
            run_at: next_run_at,
            error: error.to_string(),
        };
        self.storage.update(id, &patch).await?;
        Ok(())
    }

    /// Abandon a job for good, keeping the record.
    pub async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        let patch = JobPatch::Fail {
            failed_at: Utc::now(),
            error: error.to_string(),
        };
        self.storage.update(id, &patch).await?;
        Ok(())
    }

    /// Finish a job, keeping the record.
    pub async fn mark_completed(&self, id: JobId) -> Result<(), StoreError> {
        let patch = JobPatch::Complete {
            completed_at: Utc::now(),
        };
        self.storage.update(id, &patch).await?;
        Ok(())
    }

    /// Remove every job, returning how many were removed.
    #[instrument(name = "delayed_job.store.delete_all", skip(self))]
    pub async fn delete_all(&self) -> Result<u64, StoreError> {
        self.storage.delete_all().await
    }

    /// Release every lock held by `worker`.
    #[instrument(name = "delayed_job.store.release_locks", skip(self))]
    pub async fn release_locks(&self, worker: &str) -> Result<u64, StoreError> {
        self.storage.release_locks(worker).await
    }

    /// Load a single job.
    pub async fn find(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.storage.find(id).await
    }

    /// Number of stored jobs, finished ones included.
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.storage.count().await
    }
}
