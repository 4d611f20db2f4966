//! Ingestion job model, lifecycle transitions and the caller-facing status view.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use ingest_core::{DomainError, DomainResult, JobId, RunnerId};

const MAX_DOCUMENT_REF_LEN: usize = 2048;

/// Convert a std duration, saturating at a century for absurd values.
pub fn chrono_duration(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

/// What a caller submits: a reference to the source document plus free-form options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    /// Storage key or URL of the document to ingest.
    pub document_ref: String,
    /// Options forwarded to the stages (e.g. extraction hints).
    #[serde(default)]
    pub options: serde_json::Value,
}

impl JobInput {
    pub fn new(document_ref: impl Into<String>) -> Self {
        Self {
            document_ref: document_ref.into(),
            options: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Reject inputs no stage could make sense of.
    pub fn validate(&self) -> DomainResult<()> {
        let reference = self.document_ref.trim();
        if reference.is_empty() {
            return Err(DomainError::validation("document_ref must not be empty"));
        }
        if reference.len() != self.document_ref.len() {
            return Err(DomainError::validation(
                "document_ref must not have leading or trailing whitespace",
            ));
        }
        if self.document_ref.len() > MAX_DOCUMENT_REF_LEN {
            return Err(DomainError::validation(format!(
                "document_ref exceeds {MAX_DOCUMENT_REF_LEN} bytes"
            )));
        }
        if self.document_ref.chars().any(char::is_control) {
            return Err(DomainError::validation(
                "document_ref must not contain control characters",
            ));
        }
        if !(self.options.is_null() || self.options.is_object()) {
            return Err(DomainError::validation("options must be a JSON object"));
        }
        Ok(())
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, no stage started yet
    Pending,
    /// A stage is executing (or about to)
    Running,
    /// A retryable stage failure is waiting out its backoff
    PausedRetry,
    /// Fatal failure or exhausted retries/restarts
    Failed,
    /// Every stage checkpointed
    Completed,
    /// Cancelled between stages
    Cancelled,
}

impl JobStatus {
    pub const NON_TERMINAL: [JobStatus; 3] =
        [JobStatus::Pending, JobStatus::Running, JobStatus::PausedRetry];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Completed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::PausedRetry => "paused_retry",
            JobStatus::Failed => "failed",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused_retry" => Ok(JobStatus::PausedRetry),
            "failed" => Ok(JobStatus::Failed),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Outcome of one completed stage, as surfaced in the final job report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    /// Items the stage handled successfully.
    pub processed: usize,
    /// Source items that were dead-lettered or otherwise dropped.
    pub failed_item_ids: Vec<String>,
    /// Human-readable outcome, e.g. "212/215 images embedded, 3 dead-lettered".
    pub summary: Option<String>,
}

impl StageReport {
    pub fn failed_count(&self) -> usize {
        self.failed_item_ids.len()
    }
}

/// Per-stage outcomes accumulated over a job's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub stages: Vec<StageReport>,
}

impl JobReport {
    /// Record a stage outcome, replacing any earlier report for the same stage.
    pub fn record(&mut self, report: StageReport) {
        match self.stages.iter_mut().find(|s| s.stage == report.stage) {
            Some(existing) => *existing = report,
            None => self.stages.push(report),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn failed_count(&self) -> usize {
        self.stages.iter().map(StageReport::failed_count).sum()
    }

    pub fn has_warnings(&self) -> bool {
        self.failed_count() > 0
    }

    /// Stage summaries joined into one line.
    pub fn summary(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .stages
            .iter()
            .filter_map(|s| s.summary.as_deref())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// One submitted document moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input: JobInput,
    pub status: JobStatus,
    /// Stage currently running, or the one that last ran.
    pub current_stage: Option<String>,
    /// 0–100, never decreases.
    pub progress_percent: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Times the monitor recovered this job after a stale heartbeat.
    pub restart_count: u32,
    /// Retries spent on the current stage.
    pub stage_attempts: u32,
    /// When a `paused_retry` job may run again.
    pub retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    /// Runner currently driving the job; every write is fenced on it.
    pub owner: Option<RunnerId>,
    pub report: JobReport,
}

impl Job {
    pub fn new(input: JobInput) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            input,
            status: JobStatus::Pending,
            current_stage: None,
            progress_percent: 0,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: None,
            restart_count: 0,
            stage_attempts: 0,
            retry_at: None,
            error: None,
            cancel_requested: false,
            owner: None,
            report: JobReport::default(),
        }
    }

    pub fn document_ref(&self) -> &str {
        &self.input.document_ref
    }

    /// Raise progress to `percent` (clamped to 100). Lower values are ignored.
    pub fn raise_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent > self.progress_percent {
            self.progress_percent = percent;
            true
        } else {
            false
        }
    }

    /// Last sign of life: the heartbeat, or the last update for jobs never started.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat_at.unwrap_or(self.updated_at)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        now - self.last_seen() > chrono_duration(threshold)
    }

    pub fn mark_running(&mut self, stage: &str) {
        self.status = JobStatus::Running;
        self.current_stage = Some(stage.to_string());
        self.retry_at = None;
        self.updated_at = Utc::now();
    }

    /// A stage checkpointed; the next one starts with a fresh retry budget.
    pub fn mark_stage_done(&mut self, report: StageReport, progress: u8) {
        self.report.record(report);
        self.raise_progress(progress);
        self.stage_attempts = 0;
        self.retry_at = None;
        self.error = None;
        let now = Utc::now();
        self.updated_at = now;
        self.last_heartbeat_at = Some(now);
    }

    pub fn mark_paused(&mut self, retry_at: DateTime<Utc>, error: String) {
        self.status = JobStatus::PausedRetry;
        self.retry_at = Some(retry_at);
        self.error = Some(error);
        self.owner = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.retry_at = None;
        self.owner = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.progress_percent = 100;
        self.retry_at = None;
        self.error = None;
        self.owner = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.retry_at = None;
        self.owner = None;
        self.updated_at = Utc::now();
    }
}

/// Read-only status snapshot handed to the outer API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub current_stage: Option<String>,
    pub error: Option<String>,
    pub restart_count: u32,
    /// Completed, but some fan-out items were dead-lettered.
    pub completed_with_warnings: bool,
    pub failed_items: usize,
    pub summary: Option<String>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        let failed_items = job.report.failed_count();
        Self {
            job_id: job.id,
            status: job.status,
            progress_percent: job.progress_percent,
            current_stage: job.current_stage.clone(),
            error: job.error.clone(),
            restart_count: job.restart_count,
            completed_with_warnings: job.status == JobStatus::Completed && failed_items > 0,
            failed_items,
            summary: job.report.summary(),
        }
    }
}
