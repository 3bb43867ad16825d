//! Database schema definitions for SQLx.
//!
//! This module contains the record types persisted in the `delayed_jobs` table.
//! Field names are part of the storage contract and are shared by every
//! [`Storage`](crate::Storage) implementation.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Identifier assigned to a job record by the store.
pub type JobId = i64;

/// Represents a delayed job record in the database
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct JobRecord {
    /// Unique identifier for the job
    pub id: JobId,
    /// Serialized payload envelope (see [`codec`](crate::codec))
    pub handler: Vec<u8>,
    /// Priority of the job (lower = runs first)
    pub priority: i32,
    /// The job is not eligible to run before this instant
    pub run_at: DateTime<Utc>,
    /// Number of failed execution attempts so far
    pub attempts: i32,
    /// When the current lock was taken, if the job is locked
    pub locked_at: Option<DateTime<Utc>>,
    /// Identity of the worker holding the lock
    pub locked_by: Option<String>,
    /// Set on success when completed jobs are retained
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the job was permanently abandoned and failed jobs are retained
    pub failed_at: Option<DateTime<Utc>>,
    /// Most recent failure message
    pub last_error: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether a worker currently holds (or held, if stale) the execution lock.
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Whether the job finished for good and will never be selected again.
    pub fn is_finished(&self) -> bool {
        self.failed_at.is_some() || self.completed_at.is_some()
    }
}

/// A job that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Serialized payload envelope
    pub handler: Vec<u8>,
    /// Priority of the job (lower = runs first)
    pub priority: i32,
    /// Earliest instant the job may run
    pub run_at: DateTime<Utc>,
}
