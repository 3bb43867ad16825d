//! Conversion between [`BackgroundJob`] values and the bytes stored in
//! [`JobRecord::handler`](crate::JobRecord::handler).
//!
//! Handlers are JSON envelopes of the form `{"job_type": ..., "data": ...}`.

use crate::BackgroundJob;
use crate::errors::{PayloadError, ValidationError};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Serialize, Deserialize)]
struct Envelope {
    job_type: String,
    data: Value,
}

/// Serialize a job into handler bytes.
///
/// Fails if the job could never be loaded again: an empty job type name,
/// a serialization error, or data that does not deserialize back into `J`.
pub fn serialize<J: BackgroundJob>(job: &J) -> Result<Vec<u8>, ValidationError> {
    let job_type = J::JOB_NAME;
    if job_type.is_empty() {
        return Err(ValidationError::EmptyJobType);
    }

    let data = serde_json::to_value(job)
        .map_err(|source| ValidationError::Serialization { job_type, source })?;

    if let Err(source) = J::deserialize(&data) {
        return Err(ValidationError::NotRoundTrippable { job_type, source });
    }

    let envelope = Envelope {
        job_type: job_type.to_string(),
        data,
    };
    serde_json::to_vec(&envelope)
        .map_err(|source| ValidationError::Serialization { job_type, source })
}

trait RunnableJob<Context>: Send + Sync {
    fn job_type(&self) -> &'static str;
    fn display_name(&self) -> String;
    fn run(&self, ctx: Context) -> BoxFuture<'_, anyhow::Result<()>>;
}

impl<J: BackgroundJob> RunnableJob<J::Context> for J {
    fn job_type(&self) -> &'static str {
        J::JOB_NAME
    }

    fn display_name(&self) -> String {
        BackgroundJob::display_name(self)
    }

    fn run(&self, ctx: J::Context) -> BoxFuture<'_, anyhow::Result<()>> {
        BackgroundJob::run(self, ctx).boxed()
    }
}

/// A decoded job, ready to run.
pub struct Payload<Context> {
    job: Box<dyn RunnableJob<Context>>,
}

impl<Context> Payload<Context> {
    /// The registered job type name.
    pub fn job_type(&self) -> &'static str {
        self.job.job_type()
    }

    /// Human readable name for logs.
    pub fn display_name(&self) -> String {
        self.job.display_name()
    }

    /// Perform the job.
    pub fn run(&self, ctx: Context) -> BoxFuture<'_, anyhow::Result<()>> {
        self.job.run(ctx)
    }
}

impl<Context> fmt::Debug for Payload<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("job_type", &self.job_type())
            .finish_non_exhaustive()
    }
}

type DecodeFn<Context> = fn(Value) -> Result<Box<dyn RunnableJob<Context>>, serde_json::Error>;

fn decode<J: BackgroundJob>(
    data: Value,
) -> Result<Box<dyn RunnableJob<J::Context>>, serde_json::Error> {
    let job: J = serde_json::from_value(data)?;
    Ok(Box::new(job))
}

/// Registry of the job types this process knows how to load.
pub struct PayloadCodec<Context> {
    decoders: HashMap<&'static str, DecodeFn<Context>>,
}

impl<Context> Default for PayloadCodec<Context> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<Context> Clone for PayloadCodec<Context> {
    fn clone(&self) -> Self {
        Self {
            decoders: self.decoders.clone(),
        }
    }
}

impl<Context> fmt::Debug for PayloadCodec<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut job_types = self.job_types();
        job_types.sort_unstable();
        f.debug_struct("PayloadCodec")
            .field("job_types", &job_types)
            .finish()
    }
}

impl<Context> PayloadCodec<Context> {
    /// Names of all registered job types.
    pub fn job_types(&self) -> Vec<&'static str> {
        self.decoders.keys().copied().collect()
    }

    /// Whether a job type with this name is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.decoders.contains_key(job_type)
    }
}

impl<Context: Clone + Send + Sync + 'static> PayloadCodec<Context> {
    /// Make jobs of type `J` loadable.
    pub fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.decoders.insert(J::JOB_NAME, decode::<J>);
    }

    /// Load a job from its handler bytes.
    pub fn deserialize(&self, handler: &[u8]) -> Result<Payload<Context>, PayloadError> {
        let envelope: Envelope =
            serde_json::from_slice(handler).map_err(PayloadError::Malformed)?;

        let decode = self
            .decoders
            .get(envelope.job_type.as_str())
            .ok_or_else(|| PayloadError::UnknownJobType(envelope.job_type.clone()))?;

        let job = decode(envelope.data).map_err(|source| PayloadError::InvalidData {
            job_type: envelope.job_type,
            source,
        })?;

        Ok(Payload { job })
    }
}
