use crate::errors::EnqueueError;
use crate::schema::JobId;
use crate::storage::Storage;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;

/// The default priority of a job. Lower values run first.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
///
/// A type implementing this trait satisfies the executable contract of the
/// queue: it can be stored, loaded back, and performed.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application. It is persisted with
    /// every job and used to find the decoder when the job is loaded.
    const JOB_NAME: &'static str;

    /// Default priority of the task.
    ///
    /// [`JobStore::enqueue`] can be used to override the priority value.
    const PRIORITY: i32 = DEFAULT_PRIORITY;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Execute the task. This method should define its logic.
    ///
    /// Jobs may run more than once when a worker dies mid-run, so the
    /// implementation should be safe to repeat.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Human readable name used in logs.
    fn display_name(&self) -> String {
        Self::JOB_NAME.to_string()
    }

    /// Enqueue this job for immediate background execution.
    #[instrument(name = "delayed_job.enqueue", skip(self, store), fields(message = Self::JOB_NAME))]
    fn enqueue<S: Storage>(
        &self,
        store: &JobStore<S>,
    ) -> impl Future<Output = Result<JobId, EnqueueError>> + Send {
        store.enqueue(self, Self::PRIORITY, Utc::now())
    }

    /// Enqueue this job to run no earlier than `run_at`.
    #[instrument(
        name = "delayed_job.enqueue_at",
        skip(self, store),
        fields(message = Self::JOB_NAME)
    )]
    fn enqueue_at<S: Storage>(
        &self,
        store: &JobStore<S>,
        run_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<JobId, EnqueueError>> + Send {
        store.enqueue(self, Self::PRIORITY, run_at)
    }
}
