//! Task handler trait.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// Error returned by a task handler.
///
/// Task failures never cross the runner boundary as raw errors: the runner
/// records the message on the task and decides whether it may be retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    /// Creates a failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Creates a failure from any error, keeping its display text.
    pub fn from_error(err: impl std::error::Error) -> Self {
        Self::new(err.to_string())
    }

    /// Returns the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for TaskFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for TaskFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Work performed by a registered task.
///
/// Handlers receive the invocation input and return the output to memoize.
/// Closures `Fn(Value) -> impl Future<Output = Result<Value, TaskFailure>>`
/// implement this trait.
///
/// # Examples
///
/// ```
/// use tsuzuki_core::{TaskFailure, TaskHandler};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// struct CreatePost;
///
/// #[async_trait]
/// impl TaskHandler for CreatePost {
///     async fn run(&self, input: Value) -> Result<Value, TaskFailure> {
///         let title = input["title"].as_str().ok_or("title is required")?;
///         Ok(json!({ "postID": format!("post-{title}") }))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task once.
    async fn run(&self, input: Value) -> Result<Value, TaskFailure>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskFailure>> + Send,
{
    async fn run(&self, input: Value) -> Result<Value, TaskFailure> {
        (self)(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_is_a_handler() {
        let handler = |input: Value| async move { Ok::<_, TaskFailure>(json!({ "echo": input })) };
        let output = handler.run(json!(1)).await.unwrap();
        assert_eq!(output, json!({ "echo": 1 }));
    }

    #[tokio::test]
    async fn test_failure_conversions() {
        let handler = |_input: Value| async move { Err::<Value, _>(TaskFailure::from("nope")) };
        let err = handler.run(json!(null)).await.unwrap_err();
        assert_eq!(err.message(), "nope");

        let parse = serde_json::from_str::<Value>("{").unwrap_err();
        assert!(!TaskFailure::from_error(parse).message().is_empty());
    }
}
