//! In-memory job store for tests and single-process use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tsuzuki_core::{
    InvocationId, Job, JobError, JobId, JobState, JobStore, NewJob, Slug, StoreError,
    StoreResult, TaskExecutionRecord, TaskOutcome,
};

/// Thread-safe in-memory job store. Jobs are lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .read()
            .map_err(|err| StoreError::persistence(std::io::Error::other(err.to_string())))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .write()
            .map_err(|err| StoreError::persistence(std::io::Error::other(err.to_string())))
    }

    fn update<T>(&self, job_id: JobId, apply: impl FnOnce(&mut Job) -> T) -> StoreResult<T> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        Ok(apply(job))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> StoreResult<Job> {
        let job = Job::new(new_job, Utc::now());
        self.write()?.insert(job.id, job.clone());
        Ok(job)
    }

    async fn load(&self, job_id: JobId) -> StoreResult<Job> {
        self.read()?
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn task_record(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
    ) -> StoreResult<Option<TaskExecutionRecord>> {
        let jobs = self.read()?;
        let job = jobs.get(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        Ok(job
            .record(task_slug.as_str(), invocation_id.as_str())
            .cloned())
    }

    async fn mark_task_running(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
        input: &Value,
        inline: bool,
    ) -> StoreResult<TaskExecutionRecord> {
        self.update(job_id, |job| {
            let now = Utc::now();
            job.updated_at = now;
            let record = job.record_entry(task_slug, invocation_id, input, inline, now);
            record.mark_running(input.clone(), now);
            record.clone()
        })
    }

    async fn record_task_result(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
        outcome: TaskOutcome,
    ) -> StoreResult<TaskExecutionRecord> {
        self.update(job_id, |job| {
            let now = Utc::now();
            job.updated_at = now;
            let record = job.record_entry(task_slug, invocation_id, &Value::Null, false, now);
            record.apply_outcome(outcome, now);
            record.clone()
        })
    }

    async fn set_job_state(&self, job_id: JobId, state: JobState) -> StoreResult<()> {
        self.update(job_id, |job| job.transition(state, Utc::now()))
    }

    async fn record_job_failure(
        &self,
        job_id: JobId,
        error: JobError,
        wait_until: Option<DateTime<Utc>>,
    ) -> StoreResult<Job> {
        self.update(job_id, |job| {
            job.fail(error, wait_until, Utc::now());
            job.clone()
        })
    }

    async fn list_runnable(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let jobs = self.read()?;
        let mut runnable: Vec<Job> = jobs
            .values()
            .filter(|job| job.queue == queue && job.is_runnable(now, stale_before))
            .cloned()
            .collect();
        runnable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        runnable.truncate(limit);
        Ok(runnable)
    }
}
