//! SQLite job store.
//!
//! Jobs live in `jobs`, task execution records in `job_tasks` keyed by
//! `(job_id, task_slug, invocation_id)`. JSON payloads are stored as text and
//! timestamps as fixed-width RFC 3339 strings, so they compare correctly as
//! text. Task records are written with upserts that never touch a row whose
//! status is already `succeeded`.

use super::pool::DatabasePool;
use crate::config::StoreConfig;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use tsuzuki_core::{
    InvocationId, Job, JobError, JobId, JobState, JobStore, NewJob, Slug, StoreError,
    StoreResult, TaskExecutionRecord, TaskOutcome, TaskStatus,
};

macro_rules! select_jobs {
    ($rest:literal) => {
        concat!(
            "SELECT id, workflow_slug, queue, input, state, total_failure_count, error, ",
            "wait_until, created_at, updated_at, completed_at FROM jobs ",
            $rest
        )
    };
}

macro_rules! select_tasks {
    ($rest:literal) => {
        concat!(
            "SELECT task_slug, invocation_id, input, output, status, attempt_count, error, ",
            "inline, updated_at, completed_at FROM job_tasks ",
            $rest
        )
    };
}

/// SQLite-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: DatabasePool,
}

impl SqliteJobStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Opens (and migrates) the database at `database_url`.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with(database_url, &StoreConfig::default()).await
    }

    /// Like [`connect`](Self::connect), with pool sizes and timeouts from
    /// `config`.
    pub async fn connect_with(database_url: &str, config: &StoreConfig) -> StoreResult<Self> {
        let pool = DatabasePool::with_config(database_url, config)
            .await
            .map_err(StoreError::persistence)?;
        Ok(Self::new(pool))
    }

    async fn load_tasks(&self, job: &mut Job) -> StoreResult<()> {
        let rows = sqlx::query(select_tasks!(
            "WHERE job_id = ? ORDER BY task_slug, invocation_id"
        ))
        .bind(job.id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(StoreError::persistence)?;

        for row in &rows {
            let record = TaskRow::from_row(row)
                .map_err(StoreError::persistence)?
                .into_record()?;
            job.task_status
                .entry(record.task_slug.clone())
                .or_default()
                .insert(record.invocation_id.clone(), record);
        }
        Ok(())
    }

    async fn job_exists<'e, E>(executor: E, job_id: JobId) -> StoreResult<bool>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(executor)
            .await
            .map_err(StoreError::persistence)?;
        Ok(row.is_some())
    }

    /// Loads the job row, applies `apply` and writes the job columns back in
    /// one writer transaction.
    async fn update_job(&self, job_id: JobId, apply: impl FnOnce(&mut Job) + Send) -> StoreResult<()> {
        let mut tx = self.pool.writer.begin().await.map_err(StoreError::persistence)?;

        let row = sqlx::query(select_jobs!("WHERE id = ?"))
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::persistence)?
            .ok_or(StoreError::JobNotFound(job_id))?;
        let mut job = JobRow::from_row(&row)
            .map_err(StoreError::persistence)?
            .into_job()?;

        apply(&mut job);

        let error = job.error.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"UPDATE jobs SET
                 state = ?, total_failure_count = ?, error = ?, error_severity = ?,
                 wait_until = ?, updated_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(job.state.as_str())
        .bind(i64::from(job.total_failure_count))
        .bind(error)
        .bind(job.error.as_ref().map(|e| e.severity.to_string()))
        .bind(job.wait_until.as_ref().map(format_datetime))
        .bind(format_datetime(&job.updated_at))
        .bind(job.completed_at.as_ref().map(format_datetime))
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::persistence)?;

        tx.commit().await.map_err(StoreError::persistence)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct JobRow {
    id: String,
    workflow_slug: String,
    queue: String,
    input: String,
    state: String,
    total_failure_count: i64,
    error: Option<String>,
    wait_until: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_slug: row.try_get("workflow_slug")?,
            queue: row.try_get("queue")?,
            input: row.try_get("input")?,
            state: row.try_get("state")?,
            total_failure_count: row.try_get("total_failure_count")?,
            error: row.try_get("error")?,
            wait_until: row.try_get("wait_until")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    /// Decodes the job without its task records.
    fn into_job(self) -> StoreResult<Job> {
        let id = self
            .id
            .parse::<JobId>()
            .map_err(|e| StoreError::Serialization(format!("invalid job id: {e}")))?;
        let error: Option<JobError> = self.error.as_deref().map(serde_json::from_str).transpose()?;

        Ok(Job {
            id,
            workflow_slug: Slug::new(self.workflow_slug),
            queue: self.queue,
            input: serde_json::from_str(&self.input)?,
            task_status: Default::default(),
            state: self.state.parse::<JobState>().map_err(StoreError::Serialization)?,
            total_failure_count: to_count(self.total_failure_count)?,
            error,
            wait_until: self.wait_until.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct TaskRow {
    task_slug: String,
    invocation_id: String,
    input: String,
    output: Option<String>,
    status: String,
    attempt_count: i64,
    error: Option<String>,
    inline: bool,
    updated_at: String,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            task_slug: row.try_get("task_slug")?,
            invocation_id: row.try_get("invocation_id")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            error: row.try_get("error")?,
            inline: row.try_get("inline")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> StoreResult<TaskExecutionRecord> {
        Ok(TaskExecutionRecord {
            task_slug: Slug::new(self.task_slug),
            invocation_id: InvocationId::new(self.invocation_id),
            input: serde_json::from_str(&self.input)?,
            output: self.output.as_deref().map(serde_json::from_str).transpose()?,
            status: self.status.parse::<TaskStatus>().map_err(StoreError::Serialization)?,
            attempt_count: to_count(self.attempt_count)?,
            error: self.error,
            inline: self.inline,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid datetime '{s}': {e}")))
}

fn to_count(value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Serialization(format!("invalid count: {value}")))
}

async fn fetch_task<'e, E>(
    executor: E,
    job_id: JobId,
    task_slug: &Slug,
    invocation_id: &InvocationId,
) -> StoreResult<Option<TaskExecutionRecord>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(select_tasks!(
        "WHERE job_id = ? AND task_slug = ? AND invocation_id = ?"
    ))
    .bind(job_id.to_string())
    .bind(task_slug.as_str())
    .bind(invocation_id.as_str())
    .fetch_optional(executor)
    .await
    .map_err(StoreError::persistence)?;

    row.map(|row| {
        TaskRow::from_row(&row)
            .map_err(StoreError::persistence)?
            .into_record()
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// JobStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, new_job: NewJob) -> StoreResult<Job> {
        let job = Job::new(new_job, Utc::now());
        let created_at = format_datetime(&job.created_at);

        sqlx::query(
            r#"INSERT INTO jobs (id, workflow_slug, queue, input, state, total_failure_count, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.workflow_slug.as_str())
        .bind(&job.queue)
        .bind(serde_json::to_string(&job.input)?)
        .bind(job.state.as_str())
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool.writer)
        .await
        .map_err(StoreError::persistence)?;

        Ok(job)
    }

    async fn load(&self, job_id: JobId) -> StoreResult<Job> {
        let row = sqlx::query(select_jobs!("WHERE id = ?"))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(StoreError::persistence)?
            .ok_or(StoreError::JobNotFound(job_id))?;

        let mut job = JobRow::from_row(&row)
            .map_err(StoreError::persistence)?
            .into_job()?;
        self.load_tasks(&mut job).await?;
        Ok(job)
    }

    async fn task_record(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
    ) -> StoreResult<Option<TaskExecutionRecord>> {
        match fetch_task(&self.pool.reader, job_id, task_slug, invocation_id).await? {
            Some(record) => Ok(Some(record)),
            None if Self::job_exists(&self.pool.reader, job_id).await? => Ok(None),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    async fn mark_task_running(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
        input: &Value,
        inline: bool,
    ) -> StoreResult<TaskExecutionRecord> {
        let now = format_datetime(&Utc::now());
        let mut tx = self.pool.writer.begin().await.map_err(StoreError::persistence)?;

        if !Self::job_exists(&mut *tx, job_id).await? {
            return Err(StoreError::JobNotFound(job_id));
        }

        sqlx::query(
            r#"INSERT INTO job_tasks (job_id, task_slug, invocation_id, input, status, attempt_count, inline, updated_at)
               VALUES (?, ?, ?, ?, 'running', 0, ?, ?)
               ON CONFLICT (job_id, task_slug, invocation_id) DO UPDATE SET
                 input = excluded.input,
                 status = 'running',
                 updated_at = excluded.updated_at
               WHERE job_tasks.status != 'succeeded'"#,
        )
        .bind(job_id.to_string())
        .bind(task_slug.as_str())
        .bind(invocation_id.as_str())
        .bind(serde_json::to_string(input)?)
        .bind(inline)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::persistence)?;

        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::persistence)?;

        let record = fetch_task(&mut *tx, job_id, task_slug, invocation_id)
            .await?
            .ok_or_else(|| StoreError::Serialization("task record vanished after upsert".into()))?;
        tx.commit().await.map_err(StoreError::persistence)?;
        Ok(record)
    }

    async fn record_task_result(
        &self,
        job_id: JobId,
        task_slug: &Slug,
        invocation_id: &InvocationId,
        outcome: TaskOutcome,
    ) -> StoreResult<TaskExecutionRecord> {
        let now = format_datetime(&Utc::now());
        let (output, status, error, completed_at) = match outcome {
            TaskOutcome::Succeeded(output) => (
                Some(serde_json::to_string(&output)?),
                TaskStatus::Succeeded,
                None,
                Some(now.clone()),
            ),
            TaskOutcome::Failed(message) => (None, TaskStatus::Failed, Some(message), None),
        };

        let mut tx = self.pool.writer.begin().await.map_err(StoreError::persistence)?;

        if !Self::job_exists(&mut *tx, job_id).await? {
            return Err(StoreError::JobNotFound(job_id));
        }

        sqlx::query(
            r#"INSERT INTO job_tasks
                 (job_id, task_slug, invocation_id, input, output, status, attempt_count, error, inline, updated_at, completed_at)
               VALUES (?, ?, ?, 'null', ?, ?, 1, ?, 0, ?, ?)
               ON CONFLICT (job_id, task_slug, invocation_id) DO UPDATE SET
                 output = excluded.output,
                 status = excluded.status,
                 attempt_count = job_tasks.attempt_count + 1,
                 error = excluded.error,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at
               WHERE job_tasks.status != 'succeeded'"#,
        )
        .bind(job_id.to_string())
        .bind(task_slug.as_str())
        .bind(invocation_id.as_str())
        .bind(output)
        .bind(status.as_str())
        .bind(error)
        .bind(&now)
        .bind(completed_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::persistence)?;

        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::persistence)?;

        let record = fetch_task(&mut *tx, job_id, task_slug, invocation_id)
            .await?
            .ok_or_else(|| StoreError::Serialization("task record vanished after upsert".into()))?;
        tx.commit().await.map_err(StoreError::persistence)?;
        Ok(record)
    }

    async fn set_job_state(&self, job_id: JobId, state: JobState) -> StoreResult<()> {
        self.update_job(job_id, |job| job.transition(state, Utc::now()))
            .await
    }

    async fn record_job_failure(
        &self,
        job_id: JobId,
        error: JobError,
        wait_until: Option<DateTime<Utc>>,
    ) -> StoreResult<Job> {
        self.update_job(job_id, |job| job.fail(error, wait_until, Utc::now()))
            .await?;
        self.load(job_id).await
    }

    async fn list_runnable(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(select_jobs!(
            r#"WHERE queue = ?
                 AND (((state = 'pending'
                        OR (state = 'failed' AND COALESCE(error_severity, 'retryable') != 'terminal'))
                       AND (wait_until IS NULL OR wait_until <= ?))
                      OR (state = 'running' AND updated_at <= ?))
               ORDER BY created_at, id
               LIMIT ?"#
        ))
        .bind(queue)
        .bind(format_datetime(&now))
        .bind(format_datetime(&stale_before))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(StoreError::persistence)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = JobRow::from_row(row)
                .map_err(StoreError::persistence)?
                .into_job()?;
            self.load_tasks(&mut job).await?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn shutdown(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
