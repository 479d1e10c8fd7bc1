//! Task and workflow definitions.

use crate::context::TaskContext;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tsuzuki_core::{RetryPolicy, Schema, Slug, TaskHandler, WorkflowError};

/// Queue used by workflows that do not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// The body of a workflow.
///
/// The handler is re-executed from the start on every attempt; task calls
/// made through the [`TaskContext`] that already succeeded return their
/// stored output instead of running again. Closures
/// `Fn(Value, TaskContext) -> impl Future<Output = Result<(), WorkflowError>>`
/// implement this trait.
///
/// # Examples
///
/// ```
/// use tsuzuki::prelude::*;
/// use serde_json::{json, Value};
///
/// let handler = |input: Value, tasks: TaskContext| async move {
///     let post = tasks
///         .task("createPost", "1")
///         .input(json!({ "title": input["title"] }))
///         .run()
///         .await?;
///     tasks
///         .task("updatePost", "2")
///         .input(json!({ "post": post["postID"], "title": "X2" }))
///         .run()
///         .await?;
///     Ok::<(), WorkflowError>(())
/// };
/// let workflow = WorkflowDefinition::new("createPostAndUpdate", handler);
/// assert_eq!(workflow.slug().as_str(), "createPostAndUpdate");
/// ```
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    /// Runs one attempt of the workflow.
    async fn run(&self, input: Value, tasks: TaskContext) -> Result<(), WorkflowError>;
}

#[async_trait]
impl<F, Fut> WorkflowHandler for F
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkflowError>> + Send,
{
    async fn run(&self, input: Value, tasks: TaskContext) -> Result<(), WorkflowError> {
        (self)(input, tasks).await
    }
}

/// A registered, reusable task.
pub struct TaskDefinition {
    slug: Slug,
    label: Option<String>,
    handler: Arc<dyn TaskHandler>,
    input_schema: Schema,
    output_schema: Schema,
    retries: Option<RetryPolicy>,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("slug", &self.slug)
            .field("label", &self.label)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .field("retries", &self.retries)
            .finish()
    }
}

impl TaskDefinition {
    /// Creates a task with empty schemas and no retry policy of its own.
    pub fn new(slug: impl Into<Slug>, handler: impl TaskHandler + 'static) -> Self {
        Self {
            slug: slug.into(),
            label: None,
            handler: Arc::new(handler),
            input_schema: Schema::new(),
            output_schema: Schema::new(),
            retries: None,
        }
    }

    /// Sets a human readable label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the schema every invocation input must satisfy.
    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = schema;
        self
    }

    /// Sets the schema every successful output must satisfy.
    pub fn output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = schema;
        self
    }

    /// Sets the task's own retry policy.
    pub fn retries(mut self, policy: RetryPolicy) -> Self {
        self.retries = Some(policy);
        self
    }

    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    pub fn label_text(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn handler(&self) -> Arc<dyn TaskHandler> {
        Arc::clone(&self.handler)
    }

    pub fn input(&self) -> &Schema {
        &self.input_schema
    }

    pub fn output(&self) -> &Schema {
        &self.output_schema
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retries.as_ref()
    }
}

/// A registered workflow.
pub struct WorkflowDefinition {
    slug: Slug,
    label: Option<String>,
    interface_name: Option<String>,
    handler: Arc<dyn WorkflowHandler>,
    input_schema: Schema,
    retries: Option<RetryPolicy>,
    queue: String,
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("slug", &self.slug)
            .field("label", &self.label)
            .field("interface_name", &self.interface_name)
            .field("input_schema", &self.input_schema)
            .field("retries", &self.retries)
            .field("queue", &self.queue)
            .finish()
    }
}

impl WorkflowDefinition {
    /// Creates a workflow on the default queue with no retry policy.
    pub fn new(slug: impl Into<Slug>, handler: impl WorkflowHandler + 'static) -> Self {
        Self {
            slug: slug.into(),
            label: None,
            interface_name: None,
            handler: Arc::new(handler),
            input_schema: Schema::new(),
            retries: None,
            queue: DEFAULT_QUEUE.to_string(),
        }
    }

    /// Sets a human readable label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the name of the generated input type, for code generators.
    pub fn interface_name(mut self, name: impl Into<String>) -> Self {
        self.interface_name = Some(name.into());
        self
    }

    /// Sets the schema the job input must satisfy at enqueue.
    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = schema;
        self
    }

    /// Sets the workflow retry policy.
    ///
    /// Zero retries fails the job on the first task failure, whatever the
    /// tasks declare. Otherwise tasks without a policy inherit this one.
    pub fn retries(mut self, policy: RetryPolicy) -> Self {
        self.retries = Some(policy);
        self
    }

    /// Sets the queue jobs of this workflow are placed on.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    pub fn label_text(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface_name.as_deref()
    }

    pub fn handler(&self) -> Arc<dyn WorkflowHandler> {
        Arc::clone(&self.handler)
    }

    pub fn input(&self) -> &Schema {
        &self.input_schema
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retries.as_ref()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tsuzuki_core::{FieldKind, TaskFailure};

    #[test]
    fn test_task_definition_builder() {
        let task = TaskDefinition::new("createPost", |_input: Value| async move {
            Ok::<_, TaskFailure>(json!({ "postID": 1 }))
        })
        .label("Create post")
        .input_schema(Schema::new().required("title", FieldKind::Text))
        .output_schema(Schema::new().required("postID", FieldKind::Number))
        .retries(RetryPolicy::attempts(2));

        assert_eq!(task.slug().as_str(), "createPost");
        assert_eq!(task.label_text(), Some("Create post"));
        assert_eq!(task.input().fields().len(), 1);
        assert_eq!(task.retry_policy(), Some(&RetryPolicy::attempts(2)));
        assert!(format!("{task:?}").contains("createPost"));
    }

    #[test]
    fn test_workflow_definition_defaults() {
        let workflow = WorkflowDefinition::new("noop", |_input: Value, _tasks: TaskContext| async {
            Ok::<(), WorkflowError>(())
        });
        assert_eq!(workflow.queue_name(), DEFAULT_QUEUE);
        assert!(workflow.retry_policy().is_none());
        assert!(workflow.input().is_empty());

        let workflow = workflow
            .queue("nightly")
            .interface_name("NoopInput")
            .retries(RetryPolicy::none());
        assert_eq!(workflow.queue_name(), "nightly");
        assert_eq!(workflow.interface(), Some("NoopInput"));
        assert_eq!(workflow.retry_policy().map(RetryPolicy::max_retries), Some(0));
    }
}
