use crate::BackgroundJob;
use crate::codec::PayloadCodec;
use crate::config::WorkerConfig;
use crate::errors::StoreError;
use crate::job_runner::JobRunner;
use crate::retry::RetryPolicy;
use crate::storage::{PriorityRange, Storage};
use crate::store::JobStore;
use crate::util::worker_name;
use crate::worker::Worker;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for starting workers that lock and run jobs
pub struct Runner<S, Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    store: JobStore<S>,
    codec: PayloadCodec<Context>,
    context: Context,
    config: WorkerConfig,
    _state: PhantomData<State>,
}

impl<S, Context, State> std::fmt::Debug for Runner<S, Context, State>
where
    Context: std::fmt::Debug + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("codec", &self.codec)
            .field("context", &self.context)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static> Runner<S, Context> {
    /// Create a new runner with the given storage and context.
    pub fn new(storage: S, context: Context) -> Self {
        Self {
            store: JobStore::new(storage),
            codec: PayloadCodec::default(),
            context,
            config: WorkerConfig::default(),
            _state: PhantomData,
        }
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static, State> Runner<S, Context, State> {
    /// Register a job type the workers can run.
    pub fn register_job_type<J: BackgroundJob<Context = Context>>(
        mut self,
    ) -> Runner<S, Context, Configured> {
        self.codec.register::<J>();

        Runner {
            store: self.store,
            codec: self.codec,
            context: self.context,
            config: self.config,
            _state: PhantomData,
        }
    }

    /// The store shared by all workers, for producers and operators.
    pub fn store(&self) -> &JobStore<S> {
        &self.store
    }

    /// Replace all settings at once.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Set how many jobs a worker runs before reporting throughput.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set how long a lock is honoured before other workers may take the job over.
    pub fn max_run_time(mut self, max_run_time: Duration) -> Self {
        self.config.max_run_time = max_run_time;
        self
    }

    /// Restrict workers to a priority range.
    pub fn priority_range(mut self, priorities: PriorityRange) -> Self {
        self.config.set_priority_range(priorities);
        self
    }

    /// Set how failed jobs are retried.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.set_retry_policy(policy);
        self
    }

    /// Delete abandoned jobs (the default) or keep them marked failed.
    pub fn destroy_failed_jobs(mut self, destroy: bool) -> Self {
        self.config.destroy_failed_jobs = destroy;
        self
    }

    /// Keep successful jobs marked completed instead of deleting them.
    pub fn retain_completed_jobs(mut self, retain: bool) -> Self {
        self.config.retain_completed_jobs = retain;
        self
    }

    /// Set how many store failures in a row stop a worker.
    pub fn max_consecutive_failures(mut self, max_consecutive_failures: u32) -> Self {
        self.config.max_consecutive_failures = max_consecutive_failures;
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.config.shutdown_when_queue_empty = true;
        self
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static> Runner<S, Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to stop the workers
    /// and wait for them to finish.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let codec = Arc::new(self.codec.clone());
        let config = &self.config;

        let handles = (1..=config.num_workers)
            .map(|i| {
                let name = worker_name(i);
                info!(worker.name = %name, "Starting worker…");

                let runner = JobRunner::new(self.store.clone(), codec.clone(), self.context.clone())
                    .retry_policy(config.retry_policy())
                    .destroy_failed_jobs(config.destroy_failed_jobs)
                    .retain_completed_jobs(config.retain_completed_jobs);

                let worker = Worker::new(name.clone(), runner, shutdown_rx.clone())
                    .priority_range(config.priority_range())
                    .max_run_time(config.max_run_time)
                    .batch_size(config.batch_size)
                    .poll_interval(config.poll_interval)
                    .jitter(config.jitter)
                    .max_consecutive_failures(config.max_consecutive_failures)
                    .shutdown_when_queue_empty(config.shutdown_when_queue_empty);

                let span = info_span!("worker", worker.name = %name);
                tokio::spawn(async move { worker.run().instrument(span).await })
            })
            .collect();

        RunHandle {
            handles,
            failed: 0,
            shutdown: shutdown_tx,
        }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: FuturesUnordered<JoinHandle<Result<(), StoreError>>>,
    failed: usize,
    shutdown: watch::Sender<bool>,
}

impl RunHandle {
    /// Ask every worker to stop after its current job.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until every worker has stopped, either on its own or after
    /// [`shutdown`](Self::shutdown).
    ///
    /// Returns how many workers stopped because of store failures or a
    /// panic. Cancel safe: workers that stopped before the future was
    /// dropped stay accounted for.
    pub async fn join(&mut self) -> usize {
        while let Some(result) = self.handles.next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    error!(%error, "Background worker stopped after store failures");
                    self.failed += 1;
                }
                Err(error) => {
                    warn!(%error, "Background worker task panicked");
                    self.failed += 1;
                }
            }
        }
        self.failed
    }

    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(mut self) {
        self.join().await;
    }
}
