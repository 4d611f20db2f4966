//! Persistence boundary for jobs, checkpoints and tasks.
//!
//! The orchestrator and queue only talk to these traits. Implementations must make
//! each method atomic; in particular `save_checkpoint` writes the checkpoint row and
//! the job row together, and `claim` selects and locks rows in one step so two
//! workers never receive the same task.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ingest_core::{JobId, LeaseToken, RunnerId, TaskId};

use crate::checkpoint::Checkpoint;
use crate::job::{Job, JobStatus};
use crate::task::{DeadLetterReason, FanInStatus, Task, TaskStats, TaskStatus};

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// Another runner took over the job; the caller must stop driving it.
    #[error("job {0} is owned by another runner")]
    OwnershipLost(JobId),
    /// The claim expired or the task was re-delivered under a new lease.
    #[error("lease on task {0} is no longer held")]
    LeaseLost(TaskId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Selection criteria for job scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Empty means any status.
    pub statuses: Vec<JobStatus>,
    /// Only jobs whose last heartbeat (or update, if never started) is older.
    pub seen_before: Option<DateTime<Utc>>,
    /// Only paused jobs whose `retry_at` is at or before this instant.
    pub retry_due_by: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_statuses(statuses: impl Into<Vec<JobStatus>>) -> Self {
        Self {
            statuses: statuses.into(),
            ..Default::default()
        }
    }

    /// Jobs in `statuses` that have not shown a sign of life since `before`.
    pub fn stale(statuses: impl Into<Vec<JobStatus>>, before: DateTime<Utc>) -> Self {
        Self {
            statuses: statuses.into(),
            seen_before: Some(before),
            ..Default::default()
        }
    }

    /// Paused jobs whose backoff has elapsed.
    pub fn retry_due(now: DateTime<Utc>) -> Self {
        Self {
            statuses: vec![JobStatus::PausedRetry],
            retry_due_by: Some(now),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if let Some(before) = self.seen_before {
            if job.last_seen() >= before {
                return false;
            }
        }
        if let Some(due) = self.retry_due_by {
            match job.retry_at {
                Some(at) if at <= due => {}
                _ => return false,
            }
        }
        true
    }
}

/// Durable job + checkpoint tables.
///
/// Writes after [`JobStore::acquire`] are fenced on the owner: if the stored
/// `owner` differs, they fail with [`StoreError::OwnershipLost`]. Stored
/// `progress_percent` only ever rises and `cancel_requested` is never cleared
/// by an update.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly submitted job.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Take ownership of a non-terminal job.
    ///
    /// Succeeds when the job is unowned, already owned by `owner`, or its last sign
    /// of life is older than `stale_before`. Refreshes the heartbeat on success.
    /// Returns `None` when the job is terminal or held by a live runner.
    async fn acquire(
        &self,
        job_id: JobId,
        owner: RunnerId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Overwrite the job row (fenced).
    async fn update(&self, job: &Job, owner: RunnerId) -> Result<(), StoreError>;

    /// Append a checkpoint and write the job row in one transaction (fenced).
    ///
    /// A second checkpoint for the same `(job_id, stage_index)` is a `Conflict`.
    async fn save_checkpoint(
        &self,
        job: &Job,
        checkpoint: &Checkpoint,
        owner: RunnerId,
    ) -> Result<(), StoreError>;

    async fn latest_checkpoint(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError>;

    /// All checkpoints of a job, by stage index.
    async fn checkpoints(&self, job_id: JobId) -> Result<Vec<Checkpoint>, StoreError>;

    /// Refresh `last_heartbeat_at` (fenced).
    async fn heartbeat(
        &self,
        job_id: JobId,
        owner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Raise `progress_percent` to at least `percent` (fenced).
    async fn record_progress(
        &self,
        job_id: JobId,
        owner: RunnerId,
        percent: u8,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Cancel a job that is not running, or flag a running one.
    ///
    /// Pending and paused jobs become `cancelled` (and lose their owner) at once.
    /// Running jobs get `cancel_requested`; the orchestrator honours it between
    /// stages. Terminal jobs are returned unchanged.
    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError>;
}

/// How a failed task transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Back to pending, claimable again at `visible_at`.
    Retry { visible_at: DateTime<Utc> },
    DeadLetter(DeadLetterReason),
}

/// Durable task queue table.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a pending task. If a task with the same `(job_id, task_type, item_id)`
    /// already exists it is returned unchanged.
    async fn enqueue(&self, task: Task) -> Result<Task, StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Atomically claim up to `batch_size` claimable tasks of `task_type`.
    ///
    /// Each claimed task becomes `processing` with `visible_at = now + lease`,
    /// `attempt_count + 1`, and a fresh lease token.
    async fn claim(
        &self,
        task_type: &str,
        batch_size: usize,
        lease: Duration,
        owner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError>;

    /// Mark a task completed; requires a live lease.
    async fn complete(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError>;

    /// Record a failure; requires a live lease.
    async fn fail(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        error: &str,
        disposition: FailDisposition,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError>;

    /// Dead-letter processing tasks whose lease expired on their final attempt.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    async fn fan_in_status(&self, job_id: JobId, task_type: &str)
    -> Result<FanInStatus, StoreError>;

    /// Tasks of a job, optionally narrowed by type and status, oldest first.
    async fn list(
        &self,
        job_id: JobId,
        task_type: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, StoreError>;

    /// Dead-letter every pending task of the job with reason `cancelled`.
    /// Processing tasks are left to finish, but from now on a retryable `fail`
    /// of one of them dead-letters it as `cancelled` instead of requeueing it.
    /// Returns how many pending tasks were cancelled.
    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Put a dead-lettered task back to pending with a fresh attempt budget.
    async fn retry_dead_letter(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError>;

    /// Move completed tasks of a job out of the live table.
    async fn archive_completed(&self, job_id: JobId) -> Result<usize, StoreError>;

    async fn stats(&self, job_id: JobId) -> Result<TaskStats, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobInput;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn stale_filter_compares_last_sign_of_life() {
        let mut job = Job::new(JobInput::new("doc.pdf"));
        job.status = JobStatus::Running;
        let now = Utc::now();
        job.last_heartbeat_at = Some(now - ChronoDuration::minutes(5));

        let filter = JobFilter::stale(vec![JobStatus::Running], now - ChronoDuration::minutes(2));
        assert!(filter.matches(&job));

        job.last_heartbeat_at = Some(now);
        assert!(!filter.matches(&job));
    }

    #[test]
    fn retry_due_filter_requires_elapsed_backoff() {
        let mut job = Job::new(JobInput::new("doc.pdf"));
        let now = Utc::now();
        job.mark_paused(now + ChronoDuration::seconds(10), "timeout".into());

        assert!(!JobFilter::retry_due(now).matches(&job));
        assert!(JobFilter::retry_due(now + ChronoDuration::seconds(10)).matches(&job));
    }
}
