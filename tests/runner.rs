#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{Duration as TimeDelta, Utc};
use claims::{assert_err, assert_none, assert_some};
use delayed_job::codec;
use delayed_job::{
    BackgroundJob, JobRecord, JobRunner, JobStore, MAX_ATTEMPTS, MemoryStorage, PayloadCodec,
    PriorityRange, RetryPolicy, Runner, Worker, worker_name,
};
use insta::assert_compact_json_snapshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, watch};

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Create a test runner with common configuration
    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        context: Context,
    ) -> Runner<MemoryStorage, Context> {
        Runner::new(MemoryStorage::new(), context)
            .num_workers(2)
            .poll_interval(Duration::from_millis(10))
            .shutdown_when_queue_empty()
    }

    /// Create a single worker on top of `store` that knows the job types in `codec`
    pub(super) fn create_worker<Context: Clone + Send + Sync + 'static>(
        store: &JobStore<MemoryStorage>,
        codec: PayloadCodec<Context>,
        context: Context,
    ) -> Worker<MemoryStorage, Context> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = JobRunner::new(store.clone(), Arc::new(codec), context)
            .retry_policy(RetryPolicy::immediate(MAX_ATTEMPTS));
        Worker::new(worker_name(1), runner, shutdown_rx)
            .poll_interval(Duration::from_millis(10))
    }
}

#[derive(Serialize, Deserialize)]
struct NoopJob;

impl BackgroundJob for NoopJob {
    const JOB_NAME: &'static str = "noop";
    type Context = ();

    async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RecordingJob {
    label: String,
}

impl BackgroundJob for RecordingJob {
    const JOB_NAME: &'static str = "recording";
    type Context = Arc<Mutex<Vec<String>>>;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        ctx.lock().unwrap().push(self.label.clone());
        Ok(())
    }
}

fn recording_codec() -> PayloadCodec<Arc<Mutex<Vec<String>>>> {
    let mut codec = PayloadCodec::default();
    codec.register::<RecordingJob>();
    codec
}

/// An unlocked `RecordingJob` record, for seeding the store directly
fn recording_record(label: &str, run_at: chrono::DateTime<Utc>) -> anyhow::Result<JobRecord> {
    Ok(JobRecord {
        id: 0,
        handler: codec::serialize(&RecordingJob { label: label.into() })?,
        priority: 0,
        run_at,
        attempts: 0,
        locked_at: None,
        locked_by: None,
        completed_at: None,
        failed_at: None,
        last_error: None,
        created_at: Utc::now(),
    })
}

#[tokio::test]
async fn jobs_are_locked_when_fetched() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(())
        }
    }

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let runner =
        test_utils::create_test_runner(test_context.clone()).register_job_type::<TestJob>();
    let store = runner.store().clone();

    let job_id = TestJob.enqueue(&store).await?;
    let job = assert_some!(store.find(job_id).await?);
    assert!(!job.is_locked());

    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    let job = assert_some!(store.find(job_id).await?);
    assert!(job.is_locked());
    assert!(assert_some!(job.locked_by).starts_with("host:"));

    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    assert_none!(store.find(job_id).await?);

    Ok(())
}

#[tokio::test]
async fn jobs_are_deleted_when_successfully_run() -> anyhow::Result<()> {
    let runner = test_utils::create_test_runner(()).register_job_type::<NoopJob>();
    let store = runner.store().clone();

    assert_eq!(store.count().await?, 0);

    NoopJob.enqueue(&store).await?;
    assert_eq!(store.count().await?, 1);

    let runner = runner.start();
    runner.wait_for_shutdown().await;
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn panicking_in_jobs_updates_attempts() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            panic!()
        }
    }

    let runner = test_utils::create_test_runner(()).register_job_type::<TestJob>();
    let store = runner.store().clone();

    let job_id = TestJob.enqueue(&store).await?;

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let job = assert_some!(store.find(job_id).await?);
    assert_eq!(job.attempts, 1);
    assert!(!job.is_locked());
    assert!(job.run_at > Utc::now());

    Ok(())
}

#[tokio::test]
async fn jobs_run_in_priority_order() -> anyhow::Result<()> {
    let store = JobStore::new(MemoryStorage::new());
    let ran = Arc::new(Mutex::new(Vec::new()));

    for (label, priority) in [("later", 3), ("first", -5), ("soon", 0), ("also soon", 0)] {
        let job = RecordingJob { label: label.into() };
        store.enqueue(&job, priority, Utc::now()).await?;
    }

    let worker = test_utils::create_worker(&store, recording_codec(), ran.clone());
    let summary = worker.run_batch(100).await?;

    assert_compact_json_snapshot!(summary, @r#"{"success": 4, "failure": 0}"#);
    assert_eq!(*ran.lock().unwrap(), ["first", "soon", "also soon", "later"]);

    Ok(())
}

#[tokio::test]
async fn a_successful_batch_empties_the_queue() -> anyhow::Result<()> {
    let store = JobStore::new(MemoryStorage::new());
    let ran = Arc::new(Mutex::new(Vec::new()));

    let job = RecordingJob { label: "only".into() };
    job.enqueue(&store).await?;

    let worker = test_utils::create_worker(&store, recording_codec(), ran.clone());
    let summary = worker.run_batch(100).await?;
    assert_compact_json_snapshot!(summary, @r#"{"success": 1, "failure": 0}"#);
    assert_eq!(store.count().await?, 0);

    // Nothing left to do
    assert_none!(worker.reserve_and_run_one_job().await?);

    Ok(())
}

#[tokio::test]
async fn future_jobs_are_not_run() -> anyhow::Result<()> {
    let store = JobStore::new(MemoryStorage::new());
    let ran = Arc::new(Mutex::new(Vec::new()));

    let job = RecordingJob { label: "tomorrow".into() };
    job.enqueue_at(&store, Utc::now() + TimeDelta::days(1)).await?;

    let worker = test_utils::create_worker(&store, recording_codec(), ran.clone());
    let summary = worker.run_batch(100).await?;

    assert_compact_json_snapshot!(summary, @r#"{"success": 0, "failure": 0}"#);
    assert!(ran.lock().unwrap().is_empty());
    assert_eq!(store.count().await?, 1);

    Ok(())
}

#[tokio::test]
async fn workers_respect_their_priority_range() -> anyhow::Result<()> {
    let store = JobStore::new(MemoryStorage::new());
    let ran = Arc::new(Mutex::new(Vec::new()));

    for (label, priority) in [("below", 4), ("min", 5), ("inside", 9), ("max", 10)] {
        let job = RecordingJob { label: label.into() };
        store.enqueue(&job, priority, Utc::now()).await?;
    }

    let worker = test_utils::create_worker(&store, recording_codec(), ran.clone())
        .priority_range(PriorityRange::new(Some(5), Some(10)));
    let summary = worker.run_batch(100).await?;

    assert_compact_json_snapshot!(summary, @r#"{"success": 2, "failure": 0}"#);
    assert_eq!(*ran.lock().unwrap(), ["min", "inside"]);
    assert_eq!(store.count().await?, 2);

    let ran = Arc::new(Mutex::new(Vec::new()));
    let worker = test_utils::create_worker(&store, recording_codec(), ran.clone())
        .priority_range(PriorityRange::new(None, Some(5)));
    worker.run_batch(100).await?;
    assert_eq!(*ran.lock().unwrap(), ["below"]);

    Ok(())
}

#[tokio::test]
async fn failing_jobs_are_abandoned_after_max_attempts() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = Arc<AtomicU8>;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always broken")
        }
    }

    let store = JobStore::new(MemoryStorage::new());
    let runs = Arc::new(AtomicU8::new(0));
    let mut codec = PayloadCodec::default();
    codec.register::<TestJob>();

    TestJob.enqueue(&store).await?;

    let worker = test_utils::create_worker(&store, codec, runs.clone());
    let summary = worker.run_batch(100).await?;

    assert_compact_json_snapshot!(summary, @r#"{"success": 0, "failure": 25}"#);
    assert_eq!(runs.load(Ordering::SeqCst), 25);
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn abandoned_jobs_can_be_kept() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            anyhow::bail!("always broken")
        }
    }

    let runner = test_utils::create_test_runner(())
        .register_job_type::<TestJob>()
        .num_workers(1)
        .retry_policy(RetryPolicy::immediate(3))
        .destroy_failed_jobs(false);
    let store = runner.store().clone();

    let job_id = TestJob.enqueue(&store).await?;

    runner.start().wait_for_shutdown().await;

    let job = assert_some!(store.find(job_id).await?);
    assert_eq!(job.attempts, 3);
    assert_some!(job.failed_at);
    assert_eq!(job.last_error.as_deref(), Some("always broken"));
    assert!(!job.is_locked());

    Ok(())
}

#[tokio::test]
async fn unloadable_jobs_are_abandoned_without_retries() -> anyhow::Result<()> {
    let store = JobStore::new(MemoryStorage::new());
    NoopJob.enqueue(&store).await?;

    let ran = Arc::new(Mutex::new(Vec::new()));
    let worker = test_utils::create_worker(&store, recording_codec(), ran);
    let summary = worker.run_batch(100).await?;

    assert_compact_json_snapshot!(summary, @r#"{"success": 0, "failure": 1}"#);
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn stale_locks_are_taken_over() -> anyhow::Result<()> {
    let storage = MemoryStorage::new();
    let store = JobStore::new(storage.clone());
    let ran = Arc::new(Mutex::new(Vec::new()));

    let lock = |label: &str, locked_at| -> anyhow::Result<JobRecord> {
        Ok(JobRecord {
            locked_at: Some(locked_at),
            locked_by: Some("host:elsewhere pid:1 worker:1".into()),
            ..recording_record(label, Utc::now() - TimeDelta::hours(6))?
        })
    };

    let stale = lock("stale", Utc::now() - TimeDelta::hours(5))?;
    storage.insert_record(stale).await?;
    let fresh = lock("fresh", Utc::now() - TimeDelta::minutes(5))?;
    storage.insert_record(fresh).await?;

    let worker = test_utils::create_worker(&store, recording_codec(), ran.clone());
    let summary = worker.run_batch(100).await?;

    assert_compact_json_snapshot!(summary, @r#"{"success": 1, "failure": 0}"#);
    assert_eq!(*ran.lock().unwrap(), ["stale"]);
    assert_eq!(store.count().await?, 1);

    Ok(())
}

#[tokio::test]
async fn every_job_runs_once_across_workers() -> anyhow::Result<()> {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let runner = test_utils::create_test_runner(ran.clone())
        .register_job_type::<RecordingJob>()
        .num_workers(4);

    for i in 0..50 {
        let job = RecordingJob { label: i.to_string() };
        job.enqueue(runner.store()).await?;
    }

    runner.start().wait_for_shutdown().await;

    let mut labels = ran.lock().unwrap().clone();
    labels.sort_by_key(|label| label.parse::<u32>().unwrap());
    let expected: Vec<String> = (0..50).map(|i: u32| i.to_string()).collect();
    assert_eq!(labels, expected);
    assert_eq!(runner.store().count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn workers_give_up_after_repeated_store_failures() -> anyhow::Result<()> {
    let storage = MemoryStorage::new();
    let store = JobStore::new(storage.clone());
    let worker = test_utils::create_worker(&store, PayloadCodec::<()>::default(), ())
        .max_consecutive_failures(2);

    storage.set_unavailable(true);
    assert_err!(worker.run_batch(100).await);
    assert_err!(worker.run().await);

    Ok(())
}

#[tokio::test]
async fn workers_recover_from_transient_store_failures() -> anyhow::Result<()> {
    let storage = MemoryStorage::new();
    let runner = Runner::new(storage.clone(), ())
        .register_job_type::<NoopJob>()
        .poll_interval(Duration::from_millis(10))
        .max_consecutive_failures(10)
        .shutdown_when_queue_empty();
    NoopJob.enqueue(runner.store()).await?;

    storage.set_unavailable(true);
    let handle = runner.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    storage.set_unavailable(false);

    handle.wait_for_shutdown().await;
    assert_eq!(runner.store().count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn idle_workers_stop_on_shutdown() -> anyhow::Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new(MemoryStorage::new(), counter)
        .register_job_type::<CountingJob>()
        .num_workers(3)
        .poll_interval(Duration::from_secs(60));

    let handle = runner.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();

    tokio::time::timeout(Duration::from_secs(5), handle.wait_for_shutdown()).await?;

    Ok(())
}

#[tokio::test]
async fn shutdown_lets_the_running_job_finish_and_starts_no_other() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        shutdown_sent_barrier: Arc<Barrier>,
        runs: Arc<AtomicUsize>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.runs.fetch_add(1, Ordering::SeqCst);
            ctx.job_started_barrier.wait().await;
            ctx.shutdown_sent_barrier.wait().await;
            Ok(())
        }
    }

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        shutdown_sent_barrier: Arc::new(Barrier::new(2)),
        runs: Arc::new(AtomicUsize::new(0)),
    };

    let runner = Runner::new(MemoryStorage::new(), test_context.clone())
        .register_job_type::<TestJob>()
        .poll_interval(Duration::from_millis(10));
    let store = runner.store().clone();

    let first = TestJob.enqueue(&store).await?;
    let second = TestJob.enqueue(&store).await?;

    let handle = runner.start();
    test_context.job_started_barrier.wait().await;
    handle.shutdown();
    test_context.shutdown_sent_barrier.wait().await;

    tokio::time::timeout(Duration::from_secs(5), handle.wait_for_shutdown()).await?;

    assert_eq!(test_context.runs.load(Ordering::SeqCst), 1);
    assert_none!(store.find(first).await?);

    let job = assert_some!(store.find(second).await?);
    assert!(!job.is_locked());
    assert_eq!(job.attempts, 0);

    Ok(())
}

#[tokio::test]
async fn stopping_workers_release_their_locks() -> anyhow::Result<()> {
    let storage = MemoryStorage::new();
    let store = JobStore::new(storage.clone());

    let now = Utc::now();
    let locked = |locked_by: String| -> anyhow::Result<JobRecord> {
        Ok(JobRecord {
            locked_at: Some(now),
            locked_by: Some(locked_by),
            ..recording_record("later", now + TimeDelta::hours(1))?
        })
    };
    let mine = storage.insert_record(locked(worker_name(1))?).await?;
    let theirs = storage.insert_record(locked(worker_name(2))?).await?;

    let worker = test_utils::create_worker(&store, recording_codec(), Arc::default())
        .shutdown_when_queue_empty(true);
    worker.run().await?;

    assert!(!assert_some!(store.find(mine).await?).is_locked());
    let job = assert_some!(store.find(theirs).await?);
    assert_eq!(job.locked_by, Some(worker_name(2)));

    Ok(())
}

#[derive(Serialize, Deserialize)]
struct CountingJob;

impl BackgroundJob for CountingJob {
    const JOB_NAME: &'static str = "counting";
    type Context = Arc<AtomicUsize>;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        ctx.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
