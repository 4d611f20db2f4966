//! Fan-out task model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingest_core::{DomainError, JobId, LeaseToken, RunnerId, TaskId};

/// Task queue status.
///
/// A retryable failure puts the task back to `Pending` with a later `visible_at`,
/// so there is no separate "failed, awaiting retry" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed once `visible_at` has passed
    Pending,
    /// Claimed; hidden from other workers until the lease (`visible_at`) expires
    Processing,
    /// Finished successfully
    Completed,
    /// Gave up; kept for separate reprocessing
    DeadLetter,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLetter)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            other => Err(DomainError::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// Why a task ended up in the dead-letter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// `attempt_count` reached `max_attempts`
    Exhausted,
    /// The handler reported an unrecoverable error
    Fatal,
    /// The owning job was cancelled before the task ran
    Cancelled,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Exhausted => "exhausted",
            DeadLetterReason::Fatal => "fatal",
            DeadLetterReason::Cancelled => "cancelled",
        }
    }
}

impl core::str::FromStr for DeadLetterReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exhausted" => Ok(DeadLetterReason::Exhausted),
            "fatal" => Ok(DeadLetterReason::Fatal),
            "cancelled" => Ok(DeadLetterReason::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown dead-letter reason: {other}"
            ))),
        }
    }
}

/// A unit of fan-out work, e.g. "embed image 17 of job X".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub task_type: String,
    /// Source item key. `(job_id, task_type, item_id)` is unique.
    pub item_id: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Claims so far (incremented on every claim).
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Pending: earliest claim time. Processing: lease expiry.
    pub visible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub lease_token: Option<LeaseToken>,
    pub lease_owner: Option<RunnerId>,
    pub dead_letter_reason: Option<DeadLetterReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        job_id: JobId,
        task_type: impl Into<String>,
        item_id: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            job_id,
            task_type: task_type.into(),
            item_id: item_id.into(),
            payload,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            visible_at: now,
            last_error: None,
            result: None,
            lease_token: None,
            lease_owner: None,
            dead_letter_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and visible, or processing with an expired lease that still has
    /// attempts left.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => self.visible_at <= now,
            TaskStatus::Processing => {
                self.visible_at <= now && self.attempt_count < self.max_attempts
            }
            TaskStatus::Completed | TaskStatus::DeadLetter => false,
        }
    }

    /// Processing, lease expired, and no attempts left: nobody may claim it again.
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self.visible_at <= now
            && self.attempt_count >= self.max_attempts
    }

    pub fn holds_lease(&self, token: LeaseToken, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self.lease_token == Some(token)
            && self.visible_at > now
    }
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
    /// Worth another attempt (network blip, rate limit, timeout).
    #[error("retryable: {message}")]
    Retryable {
        message: String,
        /// Provider-suggested minimum wait, e.g. from a rate-limit response.
        retry_after: Option<Duration>,
    },
    /// Retrying cannot help (malformed input, unparseable content).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl TaskFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            TaskFailure::Retryable { message, .. } => message,
            TaskFailure::Fatal(message) => message,
        }
    }
}

/// Aggregate state of one stage's fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanInStatus {
    pub total: usize,
    pub completed: usize,
    pub dead_lettered: usize,
    /// Tasks not yet terminal; the fan-in is settled when this reaches zero.
    pub outstanding: usize,
}

impl FanInStatus {
    pub fn is_settled(&self) -> bool {
        self.outstanding == 0
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.dead_lettered
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub dead_lettered: usize,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::DeadLetter => self.dead_lettered += 1,
        }
    }
}
