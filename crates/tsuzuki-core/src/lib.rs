//! Core types and traits for the tsuzuki workflow engine.
//!
//! This crate holds the data model and the seams of the engine without any
//! runtime. Storage adapters implement [`JobStore`]; task authors implement
//! [`TaskHandler`].
//!
//! # Core Types
//!
//! - [`Job`] / [`TaskExecutionRecord`] - durable state of a workflow instance
//! - [`RetryPolicy`] / [`resolve_retry_policy`] - retry budgets and their precedence
//! - [`Schema`] - declared shape of task and workflow payloads
//! - [`WorkflowError`] - error taxonomy shared by all crates

mod error;
mod handler;
mod ids;
mod job;
mod retry;
mod schema;
mod store;

pub use error::WorkflowError;
pub use handler::{TaskFailure, TaskHandler};
pub use ids::{InvocationId, JobId, Slug};
pub use job::{
    Job, JobError, JobState, NewJob, Severity, TaskExecutionRecord, TaskOutcome, TaskStatus,
};
pub use retry::{resolve_retry_policy, EffectiveRetry, RetryPolicy, RetryPolicyError};
pub use schema::{Field, FieldKind, Schema, SchemaError};
pub use store::{JobStore, StoreError, StoreResult};
