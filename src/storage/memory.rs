use super::{JobFilter, JobPatch, LockCondition, Storage};
use crate::errors::StoreError;
use crate::schema::{JobId, JobRecord, NewJob};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    last_id: JobId,
    jobs: BTreeMap<JobId, JobRecord>,
}

/// In-process storage.
///
/// Clones share the same underlying table, so several workers in one
/// process can coordinate through it exactly like through a database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`]
    /// until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a fully formed record, keeping its lock and retry fields.
    ///
    /// The record's `id` is replaced by a freshly assigned one.
    pub async fn insert_record(&self, mut record: JobRecord) -> Result<JobId, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.last_id += 1;
        record.id = state.last_id;
        state.jobs.insert(record.id, record);
        Ok(state.last_id)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory storage switched off".into()));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let record = JobRecord {
            id: 0,
            handler: job.handler,
            priority: job.priority,
            run_at: job.run_at,
            attempts: 0,
            locked_at: None,
            locked_by: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.insert_record(record).await
    }

    async fn find_matching(
        &self,
        filter: &JobFilter,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.priority, job.run_at, job.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn try_lock(
        &self,
        id: JobId,
        condition: &LockCondition,
        locked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state
            .jobs
            .get_mut(&id)
            .is_some_and(|job| condition.lock(job, locked_at)))
    }

    async fn update(&self, id: JobId, patch: &JobPatch) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) => {
                patch.apply(job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.jobs.remove(&id).is_some())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let removed = state.jobs.len() as u64;
        state.jobs.clear();
        Ok(removed)
    }

    async fn release_locks(&self, worker: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let mut released = 0;
        for job in state.jobs.values_mut() {
            if job.locked_by.as_deref() == Some(worker) {
                job.locked_at = None;
                job.locked_by = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.jobs.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PriorityRange;
    use chrono::Duration;

    fn new_job(priority: i32) -> NewJob {
        NewJob {
            handler: b"{}".to_vec(),
            priority,
            run_at: Utc::now() - Duration::seconds(1),
        }
    }

    fn condition(worker: &str) -> LockCondition {
        LockCondition {
            worker: worker.into(),
            stale_before: Utc::now() - Duration::hours(4),
            expected_attempts: 0,
        }
    }

    fn filter(worker: &str) -> JobFilter {
        let now = Utc::now();
        JobFilter {
            ready_at: now,
            priorities: PriorityRange::default(),
            stale_before: now - Duration::hours(4),
            worker: worker.into(),
        }
    }

    #[tokio::test]
    async fn orders_by_priority_then_run_at_then_id() {
        let storage = MemoryStorage::new();
        let low = storage.insert(new_job(5)).await.unwrap();
        let high = storage.insert(new_job(-1)).await.unwrap();
        let also_high = storage.insert(new_job(-1)).await.unwrap();

        let ids: Vec<_> = storage
            .find_matching(&filter("a"), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();

        assert_eq!(ids, vec![high, also_high, low]);
    }

    #[tokio::test]
    async fn fresh_locks_of_other_workers_hide_jobs() {
        let storage = MemoryStorage::new();
        let id = storage.insert(new_job(0)).await.unwrap();
        assert!(storage.try_lock(id, &condition("a"), Utc::now()).await.unwrap());

        assert_eq!(storage.find_matching(&filter("a"), 10).await.unwrap().len(), 1);
        assert!(storage.find_matching(&filter("b"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_lock_attempts_leave_the_record_untouched() {
        let storage = MemoryStorage::new();
        let id = storage.insert(new_job(0)).await.unwrap();
        let outdated = LockCondition {
            expected_attempts: 3,
            ..condition("a")
        };

        assert!(!storage.try_lock(id, &outdated, Utc::now()).await.unwrap());
        assert!(!storage.try_lock(id + 1, &condition("a"), Utc::now()).await.unwrap());

        let job = storage.find(id).await.unwrap().unwrap();
        assert!(!job.is_locked());
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn reschedule_never_moves_run_at_backwards() {
        let storage = MemoryStorage::new();
        let later = Utc::now() + Duration::hours(1);
        let id = storage
            .insert(NewJob {
                run_at: later,
                ..new_job(0)
            })
            .await
            .unwrap();

        let patch = JobPatch::Reschedule {
            run_at: Utc::now(),
            error: "boom".into(),
        };
        storage.update(id, &patch).await.unwrap();

        let job = storage.find(id).await.unwrap().unwrap();
        assert_eq!(job.run_at, later);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unavailable_storage_fails_every_call() {
        let storage = MemoryStorage::new();
        storage.set_unavailable(true);
        assert!(matches!(storage.count().await, Err(StoreError::Unavailable(_))));
        storage.set_unavailable(false);
        assert_eq!(storage.count().await.unwrap(), 0);
    }
}
