//! Task invocation with memoized replay.
//!
//! A [`TaskContext`] is handed to the workflow handler for one attempt of a
//! job. Every task call goes through it: a call whose
//! `(task slug, invocation id)` already succeeded returns the stored output
//! without running the task, any other call runs the task, records its
//! outcome and, on failure, decides whether the retry budget allows another
//! attempt.

use crate::definition::{TaskDefinition, WorkflowDefinition};
use crate::registry::{Registry, INLINE_TASK_SLUG};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use tsuzuki_core::{
    resolve_retry_policy, InvocationId, Job, JobId, JobStore, RetryPolicy, Severity, Slug,
    TaskFailure, TaskHandler, TaskOutcome, WorkflowError,
};

type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskFailure>> + Send>>;
type InlineFn = Box<dyn FnOnce(Value) -> TaskFuture + Send>;

/// Most severe task failure seen during one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ObservedFailure {
    pub(crate) task_slug: Slug,
    pub(crate) invocation_id: InvocationId,
    pub(crate) message: String,
    pub(crate) severity: Severity,
    /// Backoff before the next attempt, from the failed task's policy.
    pub(crate) delay: Option<Duration>,
}

/// Handle through which a workflow handler invokes tasks.
///
/// Cheap to clone; clones share the per-key locks, so concurrent calls with
/// the same invocation id run the task at most once.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    job_id: JobId,
    workflow: Arc<WorkflowDefinition>,
    registry: Arc<Registry>,
    store: Arc<dyn JobStore>,
    key_locks: AsyncMutex<HashMap<(Slug, InvocationId), Arc<AsyncMutex<()>>>>,
    observed: Mutex<Option<ObservedFailure>>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("job_id", &self.inner.job_id)
            .field("workflow", self.inner.workflow.slug())
            .finish()
    }
}

enum TaskBody {
    Registered(Arc<TaskDefinition>),
    Inline(InlineFn),
}

impl TaskContext {
    pub(crate) fn new(
        job_id: JobId,
        workflow: Arc<WorkflowDefinition>,
        registry: Arc<Registry>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                job_id,
                workflow,
                registry,
                store,
                key_locks: AsyncMutex::new(HashMap::new()),
                observed: Mutex::new(None),
            }),
        }
    }

    /// Id of the job this context is bound to.
    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    /// Slug of the running workflow.
    pub fn workflow_slug(&self) -> &Slug {
        self.inner.workflow.slug()
    }

    /// Prepares a call of a registered task.
    pub fn task(
        &self,
        task_slug: impl Into<Slug>,
        invocation_id: impl Into<InvocationId>,
    ) -> TaskCall<'_> {
        TaskCall {
            ctx: self,
            task_slug: task_slug.into(),
            invocation_id: invocation_id.into(),
            input: Value::Null,
            retries: None,
        }
    }

    /// Prepares a call of a task defined at the call site.
    pub fn inline_task(&self, invocation_id: impl Into<InvocationId>) -> InlineTaskCall<'_> {
        InlineTaskCall {
            ctx: self,
            invocation_id: invocation_id.into(),
            input: Value::Null,
            retries: None,
        }
    }

    /// Memoized output of a succeeded invocation, if any.
    pub async fn output(
        &self,
        task_slug: impl Into<Slug>,
        invocation_id: impl Into<InvocationId>,
    ) -> Result<Option<Value>, WorkflowError> {
        let record = self
            .inner
            .store
            .task_record(self.inner.job_id, &task_slug.into(), &invocation_id.into())
            .await?;
        Ok(record
            .filter(|record| record.is_succeeded())
            .and_then(|record| record.output))
    }

    /// Current snapshot of the job, including every task record.
    pub async fn job(&self) -> Result<Job, WorkflowError> {
        Ok(self.inner.store.load(self.inner.job_id).await?)
    }

    pub(crate) fn observed_failure(&self) -> Option<ObservedFailure> {
        self.inner
            .observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn observe(&self, failure: ObservedFailure) {
        let mut observed = self
            .inner
            .observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let keep_previous = matches!(
            observed.as_ref(),
            Some(previous) if previous.severity > failure.severity
        );
        if !keep_previous {
            *observed = Some(failure);
        }
    }

    async fn key_lock(
        &self,
        task_slug: &Slug,
        invocation_id: &InvocationId,
    ) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.key_locks.lock().await;
        Arc::clone(
            locks
                .entry((task_slug.clone(), invocation_id.clone()))
                .or_default(),
        )
    }

    async fn invoke(
        &self,
        task_slug: Slug,
        invocation_id: InvocationId,
        input: Value,
        retry_override: Option<RetryPolicy>,
        body: TaskBody,
    ) -> Result<Value, WorkflowError> {
        let lock = self.key_lock(&task_slug, &invocation_id).await;
        let _guard = lock.lock().await;
        let store = &self.inner.store;
        let job_id = self.inner.job_id;

        if let Some(record) = store.task_record(job_id, &task_slug, &invocation_id).await? {
            if record.is_succeeded() {
                debug!(
                    job_id = %job_id,
                    task = %task_slug,
                    invocation = %invocation_id,
                    "Task already succeeded, returning stored output"
                );
                return Ok(record.output.unwrap_or(Value::Null));
            }
        }

        let inline = matches!(body, TaskBody::Inline(_));
        if let TaskBody::Registered(definition) = &body {
            definition
                .input()
                .validate(&input)
                .map_err(|source| WorkflowError::SchemaViolation {
                    target: format!("input of task '{task_slug}'"),
                    source,
                })?;
        }

        store
            .mark_task_running(job_id, &task_slug, &invocation_id, &input, inline)
            .await?;

        let task_policy = match &body {
            TaskBody::Registered(definition) => definition.retry_policy().cloned(),
            TaskBody::Inline(_) => None,
        };
        let outcome = match run_isolated(body, input).await {
            Ok(output) => TaskOutcome::Succeeded(output),
            Err(failure) => TaskOutcome::Failed(failure.message().to_string()),
        };

        let record = store
            .record_task_result(job_id, &task_slug, &invocation_id, outcome)
            .await?;
        if record.is_succeeded() {
            info!(
                job_id = %job_id,
                task = %task_slug,
                invocation = %invocation_id,
                attempt = record.attempt_count,
                "Task '{}' completed successfully",
                task_slug
            );
            return Ok(record.output.unwrap_or(Value::Null));
        }

        let retry = resolve_retry_policy(
            self.inner.workflow.retry_policy(),
            task_policy.as_ref(),
            retry_override.as_ref(),
        );
        let severity = if retry.allows_retry_after(record.attempt_count) {
            Severity::Retryable
        } else {
            Severity::Terminal
        };
        let details = record.error.unwrap_or_default();
        self.observe(ObservedFailure {
            task_slug: task_slug.clone(),
            invocation_id: invocation_id.clone(),
            message: details.clone(),
            severity,
            delay: retry.delay_after(record.attempt_count),
        });

        warn!(
            job_id = %job_id,
            task = %task_slug,
            invocation = %invocation_id,
            attempt = record.attempt_count,
            %severity,
            "Task '{}' failed: {}",
            task_slug,
            details
        );
        Err(WorkflowError::TaskExecutionFailure {
            task_slug,
            invocation_id,
            details,
            severity,
        })
    }
}

/// Runs the task body on its own tokio task so that a panic is recorded as
/// a failure instead of unwinding through the workflow handler.
async fn run_isolated(body: TaskBody, input: Value) -> Result<Value, TaskFailure> {
    let handle = match body {
        TaskBody::Registered(definition) => {
            let handler: Arc<dyn TaskHandler> = definition.handler();
            let output_schema = definition.output().clone();
            tokio::spawn(async move {
                let output = handler.run(input).await?;
                output_schema
                    .validate(&output)
                    .map_err(|err| TaskFailure::new(format!("invalid output: {err}")))?;
                Ok(output)
            })
        }
        TaskBody::Inline(run) => tokio::spawn(run(input)),
    };
    match handle.await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => Err(TaskFailure::new("task handler panicked")),
        Err(join_error) => Err(TaskFailure::from_error(join_error)),
    }
}

/// A pending call of a registered task. Created by [`TaskContext::task`].
#[must_use = "a task call does nothing until `run` is awaited"]
pub struct TaskCall<'a> {
    ctx: &'a TaskContext,
    task_slug: Slug,
    invocation_id: InvocationId,
    input: Value,
    retries: Option<RetryPolicy>,
}

impl TaskCall<'_> {
    /// Sets the task input.
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Overrides the retry policy for this invocation only.
    pub fn retries(mut self, policy: RetryPolicy) -> Self {
        self.retries = Some(policy);
        self
    }

    /// Runs the task, or returns its stored output if it already succeeded.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::UnknownTask`] if the slug is not registered
    /// - [`WorkflowError::SchemaViolation`] if the input does not match the
    ///   task's input schema
    /// - [`WorkflowError::TaskExecutionFailure`] if the task failed
    pub async fn run(self) -> Result<Value, WorkflowError> {
        let definition = self.ctx.inner.registry.task(self.task_slug.as_str())?;
        self.ctx
            .invoke(
                self.task_slug,
                self.invocation_id,
                self.input,
                self.retries,
                TaskBody::Registered(definition),
            )
            .await
    }
}

/// A pending call of an inline task. Created by [`TaskContext::inline_task`].
///
/// Inline records are stored under the `"inline"` slug; their input and
/// output are not validated.
#[must_use = "a task call does nothing until `run` is awaited"]
pub struct InlineTaskCall<'a> {
    ctx: &'a TaskContext,
    invocation_id: InvocationId,
    input: Value,
    retries: Option<RetryPolicy>,
}

impl InlineTaskCall<'_> {
    /// Sets the value passed to the task closure and recorded on the task.
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Sets the retry policy of this invocation.
    pub fn retries(mut self, policy: RetryPolicy) -> Self {
        self.retries = Some(policy);
        self
    }

    /// Runs `task`, or returns the stored output if this invocation already
    /// succeeded, in which case `task` is dropped without being called.
    pub async fn run<F, Fut>(self, task: F) -> Result<Value, WorkflowError>
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, TaskFailure>> + Send + 'static,
    {
        let body: InlineFn = Box::new(move |input| Box::pin(task(input)));
        self.ctx
            .invoke(
                Slug::new(INLINE_TASK_SLUG),
                self.invocation_id,
                self.input,
                self.retries,
                TaskBody::Inline(body),
            )
            .await
    }
}
