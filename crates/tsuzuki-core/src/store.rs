//! Persistence port for jobs and task execution records.

use crate::ids::{InvocationId, JobId, Slug};
use crate::job::{Job, JobError, JobState, NewJob, TaskExecutionRecord, TaskOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Result type for job store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage of jobs.
///
/// Every mutation is atomic per `(job, task slug, invocation id)` key, and
/// implementations never overwrite a succeeded record or a succeeded job, so
/// overlapping attempts of the same job cannot corrupt its state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new job in the `pending` state.
    async fn create(&self, new_job: NewJob) -> StoreResult<Job>;

    /// Loads a job with all of its task records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotFound`] when the job does not exist.
    async fn load(&self, job_id: JobId) -> StoreResult<Job>;

    /// Loads the record of a single invocation, if any.
    async fn task_record(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
    ) -> StoreResult<Option<TaskExecutionRecord>>;

    /// Marks an invocation as running with the given input.
    ///
    /// Creates the record if absent; leaves a succeeded record untouched.
    async fn mark_task_running(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
        input: &Value,
        inline: bool,
    ) -> StoreResult<TaskExecutionRecord>;

    /// Records the outcome of one attempt and increments its attempt count.
    ///
    /// Returns the stored record, which is the pre-existing one when the
    /// invocation had already succeeded.
    async fn record_task_result(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
        outcome: TaskOutcome,
    ) -> StoreResult<TaskExecutionRecord>;

    /// Sets the overall job state. No-op once the job has succeeded.
    async fn set_job_state(&self, job_id: JobId, state: JobState) -> StoreResult<()>;

    /// Marks the job failed, stores the error and bumps its failure count.
    async fn record_job_failure(
        &self,
        job_id: JobId,
        error: JobError,
        wait_until: Option<DateTime<Utc>>,
    ) -> StoreResult<Job>;

    /// Jobs of `queue` a scheduler may dispatch at `now`, oldest first.
    ///
    /// Includes `running` jobs last updated at or before `stale_before`:
    /// their attempt was interrupted and they resume from their records.
    async fn list_runnable(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Job>>;

    /// Releases pooled connections. Called once when the process stops.
    async fn shutdown(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Errors returned by job store implementations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The job was not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wraps a persistence error.
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
