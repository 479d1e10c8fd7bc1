//! Workflow error types.

use crate::ids::{InvocationId, JobId, Slug};
use crate::job::Severity;
use crate::schema::SchemaError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors that can occur while registering or running workflows.
///
/// Workflow handlers return this type; a `?` on a failed task call
/// propagates [`WorkflowError::TaskExecutionFailure`] and ends the attempt.
///
/// # Non-Exhaustive
///
/// New variants may be added; always include a wildcard pattern:
///
/// ```
/// use tsuzuki_core::WorkflowError;
///
/// fn describe(error: &WorkflowError) -> String {
///     match error {
///         WorkflowError::TaskExecutionFailure { task_slug, severity, .. } => {
///             format!("{task_slug} failed ({severity})")
///         }
///         WorkflowError::JobNotFound(id) => format!("no job {id}"),
///         _ => error.to_string(),
///     }
/// }
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A task or workflow slug was registered twice.
    #[error("Duplicate slug: {0}")]
    DuplicateSlug(Slug),

    /// No task is registered under the slug.
    #[error("Unknown task: {0}")]
    UnknownTask(Slug),

    /// No workflow is registered under the slug.
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(Slug),

    /// The job does not exist in the store.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// A task invocation failed.
    ///
    /// `severity` tells whether its retry budget allows another attempt.
    #[error("Task '{task_slug}' (invocation '{invocation_id}') failed, {severity}: {details}")]
    TaskExecutionFailure {
        /// Slug of the failed task.
        task_slug: Slug,
        /// Invocation that failed.
        invocation_id: InvocationId,
        /// Failure message recorded on the task.
        details: String,
        /// Whether the invocation may be retried.
        severity: Severity,
    },

    /// The workflow handler failed outside of any task call.
    ///
    /// Such work is not memoized and runs again on every attempt.
    #[error("Workflow handler fault: {0}")]
    WorkflowHandlerFault(String),

    /// A payload did not match its declared schema.
    #[error("Schema violation in {target}: {source}")]
    SchemaViolation {
        /// What was validated, e.g. `input of task 'createPost'`.
        target: String,
        /// The violations found.
        #[source]
        source: SchemaError,
    },

    /// The job store failed.
    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    /// The engine configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl WorkflowError {
    /// Creates a [`WorkflowError::WorkflowHandlerFault`].
    pub fn handler(details: impl Into<String>) -> Self {
        Self::WorkflowHandlerFault(details.into())
    }

    /// Severity of a task failure, `None` for every other variant.
    pub fn task_severity(&self) -> Option<Severity> {
        match self {
            WorkflowError::TaskExecutionFailure { severity, .. } => Some(*severity),
            _ => None,
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => WorkflowError::JobNotFound(id),
            other => WorkflowError::Store(other),
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::WorkflowHandlerFault(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorkflowError::TaskExecutionFailure {
            task_slug: Slug::new("updatePost"),
            invocation_id: InvocationId::new("2"),
            details: "connection reset".to_string(),
            severity: Severity::Retryable,
        };
        assert_eq!(
            error.to_string(),
            "Task 'updatePost' (invocation '2') failed, retryable: connection reset"
        );
        assert_eq!(error.task_severity(), Some(Severity::Retryable));

        let error = WorkflowError::DuplicateSlug(Slug::new("createPost"));
        assert_eq!(error.to_string(), "Duplicate slug: createPost");
        assert_eq!(error.task_severity(), None);
    }

    #[test]
    fn test_store_not_found_maps_to_job_not_found() {
        let id = JobId::generate();
        let error: WorkflowError = StoreError::JobNotFound(id).into();
        assert!(matches!(error, WorkflowError::JobNotFound(found) if found == id));

        let error: WorkflowError = StoreError::Serialization("bad".into()).into();
        assert!(matches!(error, WorkflowError::Store(_)));
    }

    #[test]
    fn test_schema_violation_display() {
        let error = WorkflowError::SchemaViolation {
            target: "input of task 'createPost'".to_string(),
            source: SchemaError {
                violations: vec!["missing required field 'title'".to_string()],
            },
        };
        assert_eq!(
            error.to_string(),
            "Schema violation in input of task 'createPost': missing required field 'title'"
        );
    }
}
