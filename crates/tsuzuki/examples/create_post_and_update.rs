//! Create a post, then update it. The update fails once; the retry reuses
//! the stored post instead of creating a second one.
//!
//! Reads `tsuzuki.toml` from the working directory if present; set
//! `TSUZUKI_DATABASE_URL=sqlite://jobs.db?mode=rwc` to keep jobs on disk.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tsuzuki::prelude::*;
use tsuzuki::{telemetry, EngineConfig};

struct CreatePost {
    next_id: AtomicU32,
}

#[async_trait]
impl TaskHandler for CreatePost {
    async fn run(&self, input: Value) -> Result<Value, TaskFailure> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        println!("Creating post '{}'...", input["title"]);
        Ok(json!({ "postID": id }))
    }
}

struct UpdatePost {
    calls: AtomicU32,
}

#[async_trait]
impl TaskHandler for UpdatePost {
    async fn run(&self, input: Value) -> Result<Value, TaskFailure> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(TaskFailure::new("post service unavailable"));
        }
        println!("Updating post {} to '{}'...", input["post"], input["title"]);
        Ok(json!({ "updated": true }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = EngineConfig::load("tsuzuki.toml").await?;
    telemetry::init_tracing(&config.logging)?;

    let registry = Registry::builder()
        .task(
            TaskDefinition::new("createPost", CreatePost { next_id: AtomicU32::new(100) })
                .input_schema(Schema::new().required("title", FieldKind::Text))
                .output_schema(Schema::new().required("postID", FieldKind::Number)),
        )
        .task(
            TaskDefinition::new("updatePost", UpdatePost { calls: AtomicU32::new(0) })
                .retries(RetryPolicy::fixed(3, Duration::from_millis(200))),
        )
        .workflow(
            WorkflowDefinition::new(
                "createPostAndUpdate",
                |input: Value, tasks: TaskContext| async move {
                    let post = tasks
                        .task("createPost", "1")
                        .input(json!({ "title": input["title"] }))
                        .run()
                        .await?;
                    tasks
                        .task("updatePost", "2")
                        .input(json!({ "post": post["postID"], "title": "X2" }))
                        .run()
                        .await?;
                    Ok::<(), WorkflowError>(())
                },
            )
            .input_schema(Schema::new().required("title", FieldKind::Text))
            .retries(RetryPolicy::attempts(5)),
        )
        .build()?;

    let engine = Engine::from_config(registry, &config).await?;
    let job = engine
        .enqueue("createPostAndUpdate", json!({ "title": "X" }))
        .await?;

    match engine.run_until_settled(job.id, 5).await? {
        JobOutcome::Succeeded => {
            let job = engine.job(job.id).await?;
            println!("Workflow completed after {} failed attempt(s)", job.total_failure_count);
            for record in job.records() {
                println!(
                    "  {}#{}: {} after {} attempt(s)",
                    record.task_slug, record.invocation_id, record.status, record.attempt_count
                );
            }
        }
        JobOutcome::Failed(error) => println!("Workflow failed: {error}"),
    }

    engine.shutdown().await?;
    Ok(())
}
