//! Job and task execution records.
//!
//! A [`Job`] is the durable record of one workflow instance. Its
//! `task_status` map holds one [`TaskExecutionRecord`] per
//! `(task slug, invocation id)` pair; a succeeded record is the memoized
//! result that lets a re-run skip the step.

use crate::ids::{InvocationId, JobId, Slug};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Overall state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued, never attempted.
    Pending,
    /// An attempt is in progress.
    Running,
    /// The workflow handler completed. Final.
    Succeeded,
    /// The last attempt failed; see [`Job::error`] for whether it may retry.
    Failed,
}

/// Status of a single task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Returns the persisted name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($ty))),
                }
            }
        }
    };
}

str_enum!(JobState {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

str_enum!(TaskStatus {
    NotStarted => "not-started",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

/// How bad a failure is. Ordered so that `max` picks the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Another attempt is allowed.
    Retryable,
    /// The retry budget is exhausted.
    Terminal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Retryable => f.write_str("retryable"),
            Severity::Terminal => f.write_str("terminal"),
        }
    }
}

/// Result of one task attempt, as handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The handler returned this output.
    Succeeded(Value),
    /// The handler failed with this message.
    Failed(String),
}

/// Stored state of one `(task slug, invocation id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub task_slug: Slug,
    pub invocation_id: InvocationId,
    /// Input of the most recent attempt.
    pub input: Value,
    /// Present only once the invocation succeeded.
    pub output: Option<Value>,
    pub status: TaskStatus,
    pub attempt_count: u32,
    /// Message of the most recent failure.
    pub error: Option<String>,
    /// Defined at the call site rather than in the registry.
    pub inline: bool,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskExecutionRecord {
    /// Creates a record that has not been attempted yet.
    pub fn new(
        task_slug: Slug,
        invocation_id: InvocationId,
        input: Value,
        inline: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_slug,
            invocation_id,
            input,
            output: None,
            status: TaskStatus::NotStarted,
            attempt_count: 0,
            error: None,
            inline,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Returns `true` once the output is memoized.
    pub fn is_succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    /// Marks the record running with a fresh input. No-op once succeeded.
    pub fn mark_running(&mut self, input: Value, now: DateTime<Utc>) {
        if self.is_succeeded() {
            return;
        }
        self.input = input;
        self.status = TaskStatus::Running;
        self.updated_at = now;
    }

    /// Applies the outcome of one attempt. No-op once succeeded.
    pub fn apply_outcome(&mut self, outcome: TaskOutcome, now: DateTime<Utc>) {
        if self.is_succeeded() {
            return;
        }
        self.attempt_count += 1;
        self.updated_at = now;
        match outcome {
            TaskOutcome::Succeeded(output) => {
                self.output = Some(output);
                self.status = TaskStatus::Succeeded;
                self.error = None;
                self.completed_at = Some(now);
            }
            TaskOutcome::Failed(message) => {
                self.status = TaskStatus::Failed;
                self.error = Some(message);
            }
        }
    }
}

/// Why the last attempt of a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Task that failed, `None` for faults outside any task.
    pub task_slug: Option<Slug>,
    pub invocation_id: Option<InvocationId>,
    pub message: String,
    pub severity: Severity,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.task_slug, &self.invocation_id) {
            (Some(slug), Some(id)) => write!(
                f,
                "{} failure in task '{slug}' (invocation '{id}'): {}",
                self.severity, self.message
            ),
            _ => write!(f, "{} workflow fault: {}", self.severity, self.message),
        }
    }
}

/// Parameters of a job about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub workflow_slug: Slug,
    pub queue: String,
    pub input: Value,
}

/// Durable record of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workflow_slug: Slug,
    pub queue: String,
    /// Immutable after creation.
    pub input: Value,
    pub task_status: BTreeMap<Slug, BTreeMap<InvocationId, TaskExecutionRecord>>,
    pub state: JobState,
    /// Number of failed workflow attempts.
    pub total_failure_count: u32,
    pub error: Option<JobError>,
    /// Earliest time the job should be dispatched again.
    pub wait_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job.
    pub fn new(new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            workflow_slug: new_job.workflow_slug,
            queue: new_job.queue,
            input: new_job.input,
            task_status: BTreeMap::new(),
            state: JobState::Pending,
            total_failure_count: 0,
            error: None,
            wait_until: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Looks up the record of one invocation.
    pub fn record(&self, task_slug: &str, invocation_id: &str) -> Option<&TaskExecutionRecord> {
        self.task_status
            .get(task_slug)
            .and_then(|by_id| by_id.get(invocation_id))
    }

    /// Returns the memoized output of a succeeded invocation.
    pub fn output(&self, task_slug: &str, invocation_id: &str) -> Option<&Value> {
        self.record(task_slug, invocation_id)
            .filter(|record| record.is_succeeded())
            .and_then(|record| record.output.as_ref())
    }

    /// Iterates over every task execution record.
    pub fn records(&self) -> impl Iterator<Item = &TaskExecutionRecord> {
        self.task_status.values().flat_map(|by_id| by_id.values())
    }

    /// Returns `true` when no further attempt will change the job.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            JobState::Succeeded => true,
            JobState::Failed => self
                .error
                .as_ref()
                .is_some_and(|e| e.severity == Severity::Terminal),
            JobState::Pending | JobState::Running => false,
        }
    }

    /// Returns `true` if a scheduler may dispatch the job at `now`.
    ///
    /// A `running` job is runnable only once it has not been touched since
    /// `stale_before`, which means the attempt that claimed it was lost.
    pub fn is_runnable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        let due = self.wait_until.map_or(true, |at| at <= now);
        match self.state {
            JobState::Pending => due,
            JobState::Failed => due && !self.is_terminal(),
            JobState::Running => self.updated_at <= stale_before,
            JobState::Succeeded => false,
        }
    }

    /// Returns the record for an invocation, creating it if absent.
    pub fn record_entry(
        &mut self,
        task_slug: &Slug,
        invocation_id: &InvocationId,
        input: &Value,
        inline: bool,
        now: DateTime<Utc>,
    ) -> &mut TaskExecutionRecord {
        self.task_status
            .entry(task_slug.clone())
            .or_default()
            .entry(invocation_id.clone())
            .or_insert_with(|| {
                TaskExecutionRecord::new(
                    task_slug.clone(),
                    invocation_id.clone(),
                    input.clone(),
                    inline,
                    now,
                )
            })
    }

    /// Sets the overall state. No-op once the job has succeeded.
    pub fn transition(&mut self, state: JobState, now: DateTime<Utc>) {
        if self.state == JobState::Succeeded {
            return;
        }
        self.state = state;
        self.updated_at = now;
        match state {
            JobState::Succeeded => {
                self.error = None;
                self.wait_until = None;
                self.completed_at = Some(now);
            }
            JobState::Failed if self.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
    }

    /// Records a failed attempt. No-op once the job has succeeded.
    pub fn fail(
        &mut self,
        error: JobError,
        wait_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        if self.state == JobState::Succeeded {
            return;
        }
        self.total_failure_count += 1;
        self.error = Some(error);
        self.wait_until = wait_until;
        self.transition(JobState::Failed, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job() -> Job {
        Job::new(
            NewJob {
                workflow_slug: Slug::new("createPostAndUpdate"),
                queue: "default".to_string(),
                input: json!({ "title": "X" }),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_status_names() {
        assert_eq!(TaskStatus::NotStarted.as_str(), "not-started");
        assert_eq!("failed".parse::<JobState>(), Ok(JobState::Failed));
        assert!("done".parse::<TaskStatus>().is_err());
        assert_eq!(
            serde_json::to_value(TaskStatus::NotStarted).unwrap(),
            json!("not-started")
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert_eq!(
            Severity::Retryable.max(Severity::Terminal),
            Severity::Terminal
        );
    }

    #[test]
    fn test_succeeded_record_is_immutable() {
        let now = Utc::now();
        let mut record = TaskExecutionRecord::new(
            Slug::new("createPost"),
            InvocationId::new("1"),
            json!({}),
            false,
            now,
        );
        record.apply_outcome(TaskOutcome::Succeeded(json!({ "postID": 7 })), now);
        record.apply_outcome(TaskOutcome::Failed("late writer".into()), now);
        record.mark_running(json!({ "other": true }), now);

        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.output, Some(json!({ "postID": 7 })));
        assert_eq!(record.input, json!({}));
    }

    #[test]
    fn test_output_only_for_succeeded_records() {
        let now = Utc::now();
        let mut job = new_job();
        let slug = Slug::new("createPost");
        let id = InvocationId::new("1");
        job.record_entry(&slug, &id, &json!({}), false, now)
            .apply_outcome(TaskOutcome::Failed("boom".into()), now);
        assert!(job.output("createPost", "1").is_none());
        assert_eq!(job.records().count(), 1);

        job.record_entry(&slug, &id, &json!({}), false, now)
            .apply_outcome(TaskOutcome::Succeeded(json!(1)), now);
        assert_eq!(job.output("createPost", "1"), Some(&json!(1)));
    }

    #[test]
    fn test_runnable_and_terminal() {
        let now = Utc::now();
        let mut job = new_job();
        let stale_before = now - chrono::Duration::minutes(5);
        assert!(job.is_runnable(now, stale_before));

        job.fail(
            JobError {
                task_slug: None,
                invocation_id: None,
                message: "boom".into(),
                severity: Severity::Retryable,
            },
            Some(now + chrono::Duration::seconds(30)),
            now,
        );
        assert_eq!(job.total_failure_count, 1);
        assert!(!job.is_terminal());
        assert!(!job.is_runnable(now, stale_before));
        assert!(job.is_runnable(now + chrono::Duration::seconds(31), stale_before));

        job.fail(
            JobError {
                task_slug: Some(Slug::new("a")),
                invocation_id: Some(InvocationId::new("1")),
                message: "boom".into(),
                severity: Severity::Terminal,
            },
            None,
            now,
        );
        assert!(job.is_terminal());
        assert!(job.completed_at.is_some());
        assert!(!job.is_runnable(now, stale_before));
    }

    #[test]
    fn test_running_job_is_runnable_once_stale() {
        let started = Utc::now();
        let mut job = new_job();
        job.transition(JobState::Running, started);

        assert!(!job.is_runnable(started, started - chrono::Duration::seconds(1)));
        assert!(job.is_runnable(started, started));

        job.transition(JobState::Succeeded, started);
        assert!(!job.is_runnable(started, started + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_succeeded_job_is_never_mutated() {
        let now = Utc::now();
        let mut job = new_job();
        job.transition(JobState::Succeeded, now);
        job.transition(JobState::Running, now);
        job.fail(
            JobError {
                task_slug: None,
                invocation_id: None,
                message: "late".into(),
                severity: Severity::Terminal,
            },
            None,
            now,
        );
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.total_failure_count, 0);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_job_error_display() {
        let err = JobError {
            task_slug: Some(Slug::new("updatePost")),
            invocation_id: Some(InvocationId::new("2")),
            message: "db down".into(),
            severity: Severity::Retryable,
        };
        assert_eq!(
            err.to_string(),
            "retryable failure in task 'updatePost' (invocation '2'): db down"
        );
    }
}
