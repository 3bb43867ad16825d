//! The storage seam of the queue.
//!
//! A [`Storage`] is any datastore offering atomic single-record conditional
//! updates and filtered range queries. All coordination between workers
//! happens through [`Storage::try_lock`].

use crate::errors::StoreError;
use crate::schema::{JobId, JobRecord, NewJob};
use chrono::{DateTime, Utc};
use std::future::Future;

mod memory;
mod postgres;

pub use self::memory::MemoryStorage;
pub use self::postgres::{PgStorage, setup_database};

/// Optional bounds on the priorities a worker picks up.
///
/// `min` is inclusive and `max` is exclusive. Either bound may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityRange {
    /// Only select jobs with `priority >= min`.
    pub min: Option<i32>,
    /// Only select jobs with `priority < max`.
    pub max: Option<i32>,
}

impl PriorityRange {
    /// A range with both bounds set.
    pub fn new(min: Option<i32>, max: Option<i32>) -> Self {
        Self { min, max }
    }

    /// Whether a priority falls inside the range.
    pub fn contains(&self, priority: i32) -> bool {
        self.min.is_none_or(|min| priority >= min)
            && self.max.is_none_or(|max| priority < max)
    }
}

/// Selection criteria for runnable jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    /// Only jobs with `run_at <= ready_at`.
    pub ready_at: DateTime<Utc>,
    /// Priority bounds.
    pub priorities: PriorityRange,
    /// Locks taken before this instant are stale.
    pub stale_before: DateTime<Utc>,
    /// Locks held by this worker do not exclude a job.
    pub worker: String,
}

impl JobFilter {
    /// Whether a record satisfies the filter.
    pub fn matches(&self, job: &JobRecord) -> bool {
        job.run_at <= self.ready_at
            && !job.is_finished()
            && self.priorities.contains(job.priority)
            && lock_is_takeable(job, &self.worker, self.stale_before)
    }
}

/// The state a record must be in for a lock attempt to succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockCondition {
    /// The worker trying to take the lock. It becomes the lock holder.
    pub worker: String,
    /// Locks taken before this instant are stale and may be taken over.
    pub stale_before: DateTime<Utc>,
    /// The attempt count the candidate was read with.
    pub expected_attempts: i32,
}

impl LockCondition {
    /// Whether a record currently satisfies the condition.
    pub fn holds_for(&self, job: &JobRecord) -> bool {
        job.attempts == self.expected_attempts
            && !job.is_finished()
            && lock_is_takeable(job, &self.worker, self.stale_before)
    }

    /// Take the lock on an in-memory record if the condition holds.
    pub fn lock(&self, job: &mut JobRecord, locked_at: DateTime<Utc>) -> bool {
        if !self.holds_for(job) {
            return false;
        }
        job.locked_at = Some(locked_at);
        job.locked_by = Some(self.worker.clone());
        true
    }
}

fn lock_is_takeable(job: &JobRecord, worker: &str, stale_before: DateTime<Utc>) -> bool {
    match job.locked_at {
        None => true,
        Some(locked_at) => locked_at < stale_before || job.locked_by.as_deref() == Some(worker),
    }
}

/// A mutation of a single job record, issued by the lock holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPatch {
    /// Count a failed attempt and push the job into the future.
    ///
    /// `run_at` never moves backwards: the stored value becomes the later of
    /// the current `run_at` and the given one.
    Reschedule {
        /// Next eligible instant.
        run_at: DateTime<Utc>,
        /// Failure message.
        error: String,
    },
    /// Count the final attempt and abandon the job, keeping the record.
    Fail {
        /// Abandonment timestamp.
        failed_at: DateTime<Utc>,
        /// Failure message.
        error: String,
    },
    /// Finish the job, keeping the record.
    Complete {
        /// Completion timestamp.
        completed_at: DateTime<Utc>,
    },
}

impl JobPatch {
    /// Apply the patch to an in-memory record.
    pub fn apply(&self, job: &mut JobRecord) {
        match self {
            JobPatch::Reschedule { run_at, error } => {
                job.attempts += 1;
                job.run_at = job.run_at.max(*run_at);
                job.last_error = Some(error.clone());
                job.locked_at = None;
                job.locked_by = None;
            }
            JobPatch::Fail { failed_at, error } => {
                job.attempts += 1;
                job.failed_at = Some(*failed_at);
                job.last_error = Some(error.clone());
                job.locked_at = None;
                job.locked_by = None;
            }
            JobPatch::Complete { completed_at } => {
                job.completed_at = Some(*completed_at);
                job.locked_at = None;
                job.locked_by = None;
            }
        }
    }
}

/// Store adapter used by [`JobStore`](crate::JobStore).
///
/// Every method must be atomic at the granularity of a single record.
pub trait Storage: Send + Sync + 'static {
    /// Persist a new job and return its identifier.
    fn insert(&self, job: NewJob) -> impl Future<Output = Result<JobId, StoreError>> + Send;

    /// Return up to `limit` jobs matching the filter, ordered by
    /// `priority`, then `run_at`, then `id`, all ascending.
    fn find_matching(
        &self,
        filter: &JobFilter,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<JobRecord>, StoreError>> + Send;

    /// Lock the record for `condition.worker` at `locked_at`, but only if
    /// it currently satisfies `condition`.
    ///
    /// This must be a single compare-and-swap; at most one of several
    /// concurrent callers may observe `true`. A `false` result leaves the
    /// record untouched.
    fn try_lock(
        &self,
        id: JobId,
        condition: &LockCondition,
        locked_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Apply `patch` unconditionally. Returns `false` if the record is gone.
    fn update(
        &self,
        id: JobId,
        patch: &JobPatch,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Remove a record. Returns `false` if it was already gone.
    fn delete(&self, id: JobId) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Remove every record. Returns the number of removed records.
    fn delete_all(&self) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Clear every lock held by `worker`. Returns the number of released jobs.
    fn release_locks(&self, worker: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Load a single record.
    fn find(
        &self,
        id: JobId,
    ) -> impl Future<Output = Result<Option<JobRecord>, StoreError>> + Send;

    /// Number of records, including failed and completed ones.
    fn count(&self) -> impl Future<Output = Result<u64, StoreError>> + Send;
}
