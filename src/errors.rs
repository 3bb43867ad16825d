use thiserror::Error;

/// The store could not be reached or returned an unexpected error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error returned by the database driver.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// The store refused to serve the request.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// A job was rejected at enqueue time because it could never be run.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The job type name is empty.
    #[error("cannot enqueue a job with an empty job type name")]
    EmptyJobType,
    /// The job could not be serialized.
    #[error("failed to serialize job `{job_type}`: {source}")]
    Serialization {
        /// Name of the offending job type.
        job_type: &'static str,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
    /// The serialized job does not decode back into its own type.
    #[error("job `{job_type}` does not deserialize from its own serialized form: {source}")]
    NotRoundTrippable {
        /// Name of the offending job type.
        job_type: &'static str,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// A stored handler cannot be turned back into a runnable job.
///
/// This is never retried: the job can only run again after a deploy that
/// knows how to decode it.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The handler bytes are not a valid payload envelope.
    #[error("job failed to load: malformed handler: {0}")]
    Malformed(#[source] serde_json::Error),
    /// No job type with this name is registered in this process.
    #[error("job failed to load: unknown job type `{0}`")]
    UnknownJobType(String),
    /// The job data does not match the registered job type.
    #[error("job failed to load: invalid data for job type `{job_type}`: {source}")]
    InvalidData {
        /// Name of the job type found in the envelope.
        job_type: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// Error type for job enqueueing operations.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The job does not satisfy the executable contract.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The job could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for EnqueueError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(error))
    }
}

/// Why a locked job did not complete.
#[derive(Debug, Error)]
pub(crate) enum JobFailure {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Execution(anyhow::Error),
}
