#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
pub mod cli;
pub mod codec;
pub mod config;
mod errors;
mod job_runner;
mod retry;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod store;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, DEFAULT_PRIORITY};
/// Registry and envelope format of stored jobs.
pub use self::codec::{Payload, PayloadCodec};
/// Worker configuration.
pub use self::config::WorkerConfig;
/// Error types.
pub use self::errors::{EnqueueError, PayloadError, StoreError, ValidationError};
/// Per-job lock/run/settle protocol.
pub use self::job_runner::{JobOutcome, JobRunner};
/// Retry backoff.
pub use self::retry::{MAX_ATTEMPTS, RetryPolicy};
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, RunHandle, Runner, Unconfigured};
/// The persisted job record.
pub use self::schema::{JobId, JobRecord, NewJob};
/// Storage adapters.
pub use self::storage::{
    JobFilter, JobPatch, LockCondition, MemoryStorage, PgStorage, PriorityRange, Storage,
    setup_database,
};
/// Queue operations.
pub use self::store::JobStore;
/// Worker identities.
pub use self::util::worker_name;
/// The polling loop.
pub use self::worker::{WorkSummary, Worker};
