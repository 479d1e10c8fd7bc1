//! A re-entrant workflow engine with durable step memoization.
//!
//! A workflow is an async handler that calls named tasks, each with an
//! invocation id chosen by the author. Every task call is recorded on the
//! job. When a job fails and is executed again, the handler runs from the
//! top, tasks that already succeeded return their stored output, and only
//! the failed or unfinished work runs again.
//!
//! # Example
//!
//! ```rust
//! use tsuzuki::prelude::*;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkflowError> {
//!     let registry = Registry::builder()
//!         .task(
//!             TaskDefinition::new("createPost", |input: Value| async move {
//!                 Ok::<_, TaskFailure>(json!({ "postID": format!("post-{}", input["title"]) }))
//!             })
//!             .retries(RetryPolicy::attempts(2)),
//!         )
//!         .workflow(WorkflowDefinition::new(
//!             "publish",
//!             |input: Value, tasks: TaskContext| async move {
//!                 tasks.task("createPost", "1").input(input).run().await?;
//!                 Ok::<(), WorkflowError>(())
//!             },
//!         ))
//!         .build()?;
//!
//!     let engine = Engine::new(registry, Arc::new(InMemoryJobStore::new()));
//!     let job = engine.enqueue("publish", json!({ "title": "hello" })).await?;
//!     let outcome = engine.execute(job.id).await?;
//!     assert!(outcome.is_succeeded());
//!     Ok(())
//! }
//! ```

pub mod config;
mod context;
mod definition;
mod engine;
mod registry;
pub mod store;
pub mod telemetry;

// Re-export core types
pub use tsuzuki_core::*;

pub use config::{ConfigError, EngineConfig, LoggingConfig, QueueConfig, StoreConfig};
pub use context::{InlineTaskCall, TaskCall, TaskContext};
pub use definition::{TaskDefinition, WorkflowDefinition, WorkflowHandler, DEFAULT_QUEUE};
pub use engine::{Engine, JobOutcome};
pub use registry::{Registry, RegistryBuilder, INLINE_TASK_SLUG};
pub use store::{InMemoryJobStore, SqliteJobStore};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        Engine, FieldKind, InMemoryJobStore, InvocationId, Job, JobId, JobOutcome, JobState,
        Registry, RegistryBuilder, RetryPolicy, Schema, Severity, Slug, SqliteJobStore,
        TaskContext, TaskDefinition, TaskFailure, TaskHandler, WorkflowDefinition,
        WorkflowError, WorkflowHandler,
    };
}
