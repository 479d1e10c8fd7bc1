//! Workflow executor and queue runner.

use crate::config::{EngineConfig, QueueConfig};
use crate::context::TaskContext;
use crate::definition::WorkflowDefinition;
use crate::registry::Registry;
use crate::store;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tsuzuki_core::{
    resolve_retry_policy, Job, JobError, JobId, JobState, JobStore, NewJob, Severity,
    WorkflowError,
};

/// Result of one [`Engine::execute`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The workflow handler ran to completion.
    Succeeded,
    /// The attempt failed. The error is also stored on the job.
    Failed(JobError),
}

impl JobOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }

    /// Returns `true` if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobOutcome::Failed(error) if error.severity == Severity::Retryable)
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobOutcome::Succeeded => None,
            JobOutcome::Failed(error) => Some(error),
        }
    }
}

/// Runs jobs against a registry of definitions and a job store.
///
/// The engine has no background workers: callers decide when to
/// [`execute`](Engine::execute) a job or drain a queue with
/// [`run_queue`](Engine::run_queue).
///
/// # Examples
///
/// ```
/// use tsuzuki::prelude::*;
/// use serde_json::{json, Value};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), WorkflowError> {
/// let registry = Registry::builder()
///     .task(TaskDefinition::new("double", |input: Value| async move {
///         let n = input["n"].as_i64().ok_or("n is required")?;
///         Ok::<_, TaskFailure>(json!({ "n": n * 2 }))
///     }))
///     .workflow(WorkflowDefinition::new("doubleTwice", |input: Value, tasks: TaskContext| async move {
///         let once = tasks.task("double", "1").input(input).run().await?;
///         tasks.task("double", "2").input(once).run().await?;
///         Ok::<(), WorkflowError>(())
///     }))
///     .build()?;
///
/// let engine = Engine::new(registry, Arc::new(InMemoryJobStore::new()));
/// let job = engine.enqueue("doubleTwice", json!({ "n": 3 })).await?;
/// assert!(engine.execute(job.id).await?.is_succeeded());
///
/// let job = engine.job(job.id).await?;
/// assert_eq!(job.output("double", "2"), Some(&json!({ "n": 12 })));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    store: Arc<dyn JobStore>,
    queue: QueueConfig,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the default queue settings.
    pub fn new(registry: Registry, store: Arc<dyn JobStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            queue: QueueConfig::default(),
        }
    }

    /// Creates an engine whose store and queue settings come from `config`.
    pub async fn from_config(
        registry: Registry,
        config: &EngineConfig,
    ) -> Result<Self, WorkflowError> {
        let store = store::open(&config.store).await?;
        Ok(Self::new(registry, store).with_queue_config(config.queue.clone()))
    }

    /// Replaces the queue settings used by [`run_pending`](Engine::run_pending).
    pub fn with_queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Loads a job with its task records.
    pub async fn job(&self, job_id: JobId) -> Result<Job, WorkflowError> {
        Ok(self.store.load(job_id).await?)
    }

    /// Creates a pending job for a registered workflow.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::UnknownWorkflow`] if the slug is not registered
    /// - [`WorkflowError::SchemaViolation`] if `input` does not match the
    ///   workflow's input schema
    pub async fn enqueue(&self, workflow_slug: &str, input: Value) -> Result<Job, WorkflowError> {
        let workflow = self.registry.workflow(workflow_slug)?;
        workflow
            .input()
            .validate(&input)
            .map_err(|source| WorkflowError::SchemaViolation {
                target: format!("input of workflow '{workflow_slug}'"),
                source,
            })?;

        let job = self
            .store
            .create(NewJob {
                workflow_slug: workflow.slug().clone(),
                queue: workflow.queue_name().to_string(),
                input,
            })
            .await?;
        info!(job_id = %job.id, queue = %job.queue, "Enqueued workflow '{}'", workflow_slug);
        Ok(job)
    }

    /// Runs one attempt of a job.
    ///
    /// The workflow handler is re-run from the start; tasks that already
    /// succeeded return their stored output, so only the unfinished part of
    /// the workflow does any work. A job that already succeeded or failed
    /// terminally is not run again and its final outcome is returned.
    ///
    /// Workflow failures are reported as [`JobOutcome::Failed`]; `Err` is
    /// reserved for unknown jobs or workflows and store failures.
    pub async fn execute(&self, job_id: JobId) -> Result<JobOutcome, WorkflowError> {
        let job = self.store.load(job_id).await?;
        if job.state == JobState::Succeeded {
            debug!(job_id = %job_id, "Job already succeeded");
            return Ok(JobOutcome::Succeeded);
        }
        if let Some(error) = job.error.as_ref().filter(|_| job.is_terminal()) {
            debug!(job_id = %job_id, "Job already failed terminally");
            return Ok(JobOutcome::Failed(error.clone()));
        }

        let workflow = self.registry.workflow(job.workflow_slug.as_str())?;
        self.store.set_job_state(job_id, JobState::Running).await?;
        info!(
            job_id = %job_id,
            attempt = job.total_failure_count + 1,
            "Running workflow '{}'",
            workflow.slug()
        );

        let tasks = TaskContext::new(
            job_id,
            Arc::clone(&workflow),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
        );
        let handler = workflow.handler();
        let input = job.input.clone();
        let attempt_tasks = tasks.clone();
        let attempt = tokio::spawn(async move { handler.run(input, attempt_tasks).await });
        let result = match attempt.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                Err(WorkflowError::handler("workflow handler panicked"))
            }
            Err(join_error) => Err(WorkflowError::handler(join_error.to_string())),
        };

        let (error, delay) = match result {
            Ok(()) => match tasks.observed_failure() {
                Some(observed) if observed.severity == Severity::Terminal => {
                    debug!(
                        job_id = %job_id,
                        task = %observed.task_slug,
                        "Handler returned after a terminal task failure"
                    );
                    (
                        JobError {
                            task_slug: Some(observed.task_slug),
                            invocation_id: Some(observed.invocation_id),
                            message: observed.message,
                            severity: Severity::Terminal,
                        },
                        None,
                    )
                }
                _ => {
                    self.store.set_job_state(job_id, JobState::Succeeded).await?;
                    info!(job_id = %job_id, "Workflow '{}' completed successfully", workflow.slug());
                    return Ok(JobOutcome::Succeeded);
                }
            },
            Err(err) => classify_failure(&workflow, &job, &tasks, err),
        };

        let wait_until = delay
            .filter(|_| error.severity == Severity::Retryable)
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .map(|delay| Utc::now() + delay);
        let job = self
            .store
            .record_job_failure(job_id, error.clone(), wait_until)
            .await?;
        warn!(
            job_id = %job_id,
            failures = job.total_failure_count,
            severity = %error.severity,
            "Workflow '{}' failed: {}",
            workflow.slug(),
            error
        );
        Ok(JobOutcome::Failed(error))
    }

    /// Executes up to `limit` runnable jobs of `queue` once each, oldest
    /// first.
    ///
    /// Jobs left `running` for longer than the configured lease are resumed.
    /// Jobs whose workflow is not registered in this engine are skipped.
    pub async fn run_queue(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<(JobId, JobOutcome)>, WorkflowError> {
        let now = Utc::now();
        let stale_before = chrono::Duration::from_std(self.queue.lease())
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let jobs = self
            .store
            .list_runnable(queue, now, stale_before, limit)
            .await?;
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            if job.state == JobState::Running {
                warn!(
                    job_id = %job.id,
                    last_update = %job.updated_at,
                    "Resuming interrupted job"
                );
            }
            match self.execute(job.id).await {
                Ok(outcome) => outcomes.push((job.id, outcome)),
                Err(WorkflowError::UnknownWorkflow(slug)) => {
                    warn!(job_id = %job.id, "Skipping job of unknown workflow '{}'", slug);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcomes)
    }

    /// Runs one pass over the configured default queue.
    pub async fn run_pending(&self) -> Result<Vec<(JobId, JobOutcome)>, WorkflowError> {
        self.run_queue(&self.queue.default, self.queue.batch_limit)
            .await
    }

    /// Executes a job until it succeeds, fails terminally or `max_attempts`
    /// attempts have run, sleeping until the job's `wait_until` between
    /// attempts.
    pub async fn run_until_settled(
        &self,
        job_id: JobId,
        max_attempts: u32,
    ) -> Result<JobOutcome, WorkflowError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = self.execute(job_id).await?;
            if !outcome.is_retryable() || attempt >= max_attempts {
                return Ok(outcome);
            }

            info!(
                job_id = %job_id,
                "Job failed, starting attempt {}/{}",
                attempt + 1,
                max_attempts
            );
            if let Some(delay) = self.store.load(job_id).await?.wait_until.and_then(|at| {
                (at - Utc::now()).to_std().ok()
            }) {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    /// Releases the store's resources.
    pub async fn shutdown(&self) -> Result<(), WorkflowError> {
        self.store.shutdown().await?;
        info!("Engine shut down");
        Ok(())
    }
}

/// Turns the error that aborted an attempt into the job error to store, with
/// the backoff before the next attempt.
///
/// The severity is the worst of the returned error and every task failure
/// observed during the attempt. Errors raised outside task calls are bounded
/// by the workflow's own retry policy.
fn classify_failure(
    workflow: &WorkflowDefinition,
    job: &Job,
    tasks: &TaskContext,
    err: WorkflowError,
) -> (JobError, Option<Duration>) {
    let observed = tasks.observed_failure();
    let (task_slug, invocation_id, message, severity, delay) = match err {
        WorkflowError::TaskExecutionFailure {
            task_slug,
            invocation_id,
            details,
            severity,
        } => (
            Some(task_slug),
            Some(invocation_id),
            details,
            severity,
            observed.as_ref().and_then(|failure| failure.delay),
        ),
        other => {
            let failures = job.total_failure_count + 1;
            let retry = resolve_retry_policy(workflow.retry_policy(), None, None);
            let severity = if retry.allows_retry_after(failures) {
                Severity::Retryable
            } else {
                Severity::Terminal
            };
            let message = match other {
                WorkflowError::WorkflowHandlerFault(details) => details,
                other => other.to_string(),
            };
            (None, None, message, severity, retry.delay_after(failures))
        }
    };

    let severity = observed.map_or(severity, |failure| failure.severity.max(severity));
    (
        JobError {
            task_slug,
            invocation_id,
            message,
            severity,
        },
        delay,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TaskDefinition;
    use crate::store::InMemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tsuzuki_core::{FieldKind, RetryPolicy, Schema, TaskFailure};

    fn engine(registry: Registry) -> Engine {
        Engine::new(registry, Arc::new(InMemoryJobStore::new()))
    }

    #[tokio::test]
    async fn test_enqueue_validates_input() {
        let registry = Registry::builder()
            .workflow(
                WorkflowDefinition::new("greet", |_input: Value, _tasks: TaskContext| async {
                    Ok::<(), WorkflowError>(())
                })
                .input_schema(Schema::new().required("name", FieldKind::Text))
                .queue("greetings"),
            )
            .build()
            .unwrap();
        let engine = engine(registry);

        let err = engine.enqueue("greet", json!({ "name": 1 })).await.unwrap_err();
        assert!(matches!(err, WorkflowError::SchemaViolation { .. }));
        assert!(matches!(
            engine.enqueue("missing", json!({})).await,
            Err(WorkflowError::UnknownWorkflow(_))
        ));

        let job = engine.enqueue("greet", json!({ "name": "Ada" })).await.unwrap();
        assert_eq!(job.queue, "greetings");
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_handler_fault_is_bounded_by_workflow_retries() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let registry = Registry::builder()
            .workflow(
                WorkflowDefinition::new("flaky", move |_input: Value, _tasks: TaskContext| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(WorkflowError::handler("no luck"))
                    }
                })
                .retries(RetryPolicy::attempts(1)),
            )
            .build()
            .unwrap();
        let engine = engine(registry);
        let job = engine.enqueue("flaky", json!({})).await.unwrap();

        let first = engine.execute(job.id).await.unwrap();
        assert!(first.is_retryable());
        assert_eq!(first.error().map(|e| e.message.as_str()), Some("no luck"));
        assert!(first.error().unwrap().task_slug.is_none());

        let second = engine.execute(job.id).await.unwrap();
        assert_eq!(second.error().map(|e| e.severity), Some(Severity::Terminal));

        let third = engine.execute(job.id).await.unwrap();
        assert_eq!(third, second);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(engine.job(job.id).await.unwrap().total_failure_count, 2);
    }

    #[tokio::test]
    async fn test_panicking_handlers_become_failures() {
        let registry = Registry::builder()
            .task(TaskDefinition::new("explode", |_input: Value| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, TaskFailure>(Value::Null)
            }))
            .workflow(WorkflowDefinition::new(
                "usesExplode",
                |_input: Value, tasks: TaskContext| async move {
                    tasks.task("explode", "1").run().await?;
                    Ok::<(), WorkflowError>(())
                },
            ))
            .build()
            .unwrap();
        let engine = engine(registry);
        let job = engine.enqueue("usesExplode", json!({})).await.unwrap();

        let outcome = engine.execute(job.id).await.unwrap();
        assert!(outcome.is_retryable());
        let job = engine.job(job.id).await.unwrap();
        let record = job.record("explode", "1").unwrap();
        assert_eq!(record.error.as_deref(), Some("task handler panicked"));
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_run_until_settled_waits_for_backoff() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let registry = Registry::builder()
            .task(
                TaskDefinition::new("eventually", move |_input: Value| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(TaskFailure::new("not yet"))
                        } else {
                            Ok::<_, TaskFailure>(json!("done"))
                        }
                    }
                })
                .retries(RetryPolicy::fixed(3, Duration::from_millis(5))),
            )
            .workflow(WorkflowDefinition::new(
                "patient",
                |_input: Value, tasks: TaskContext| async move {
                    tasks.task("eventually", "1").run().await?;
                    Ok::<(), WorkflowError>(())
                },
            ))
            .build()
            .unwrap();
        let engine = engine(registry);
        let job = engine.enqueue("patient", json!({})).await.unwrap();

        let outcome = engine.run_until_settled(job.id, 5).await.unwrap();
        assert!(outcome.is_succeeded());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let job = engine.job(job.id).await.unwrap();
        assert_eq!(job.total_failure_count, 2);
        assert!(job.wait_until.is_none());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_run_queue_drains_runnable_jobs() {
        let registry = Registry::builder()
            .workflow(WorkflowDefinition::new("noop", |_input: Value, _tasks: TaskContext| async {
                Ok::<(), WorkflowError>(())
            }))
            .build()
            .unwrap();
        let engine = engine(registry);
        let first = engine.enqueue("noop", json!({})).await.unwrap();
        let second = engine.enqueue("noop", json!({})).await.unwrap();

        let outcomes = engine.run_pending().await.unwrap();
        let ids: Vec<JobId> = outcomes.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id) && ids.contains(&second.id));
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_succeeded()));
        assert!(engine.run_pending().await.unwrap().is_empty());

        engine.shutdown().await.unwrap();
    }
}
