//! Stage executor interface, per-stage context and pipeline definitions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use ingest_core::{DomainError, DomainResult, JobId, RunnerId};

use crate::job::{JobInput, StageReport};
use crate::queue::{FanInOutcome, TaskQueue};
use crate::store::{JobStore, StoreError};
use crate::task::Task;

/// Slice of the job's 0–100 progress owned by one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressBand {
    start: u8,
    end: u8,
}

impl ProgressBand {
    pub fn new(start: u8, end: u8) -> DomainResult<Self> {
        if start >= end || end > 100 {
            return Err(DomainError::validation(format!(
                "invalid progress band [{start}, {end})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u8 {
        self.start
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    /// Progress after `done` of `total` sub-items finished.
    pub fn at(&self, done: usize, total: usize) -> u8 {
        if total == 0 {
            return self.start;
        }
        let done = done.min(total) as u64;
        let width = u64::from(self.end - self.start);
        self.start + (width * done / total as u64) as u8
    }
}

/// Stage failure, classified for the orchestrator's retry decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("retryable stage failure: {0}")]
    Retryable(String),

    #[error("fatal stage failure: {0}")]
    Fatal(String),

    #[error("stage exceeded its max duration of {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StageError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Retryable(_) | StageError::Timeout(_) => true,
            StageError::Fatal(_) => false,
            StageError::Store(err) => matches!(err, StoreError::Storage(_)),
        }
    }

    /// Another runner took the job over; the current one must stop.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, StageError::Store(StoreError::OwnershipLost(_)))
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("malformed stage payload: {err}"))
    }
}

/// What a stage produced. Becomes the checkpoint's state blob plus a report entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageResult {
    pub output: serde_json::Value,
    pub processed: usize,
    pub failed_item_ids: Vec<String>,
    pub summary: Option<String>,
}

impl StageResult {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn processed(mut self, processed: usize) -> Self {
        self.processed = processed;
        self
    }

    pub fn failed_items(mut self, ids: Vec<String>) -> Self {
        self.failed_item_ids = ids;
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Take counts and summary from a settled fan-out.
    pub fn with_fan_in(mut self, outcome: &FanInOutcome, noun: &str, verb: &str) -> Self {
        self.processed = outcome.completed;
        self.failed_item_ids = outcome.failed_item_ids.clone();
        self.summary = Some(outcome.summary(noun, verb));
        self
    }

    pub fn report(&self, stage: &str) -> StageReport {
        StageReport {
            stage: stage.to_string(),
            processed: self.processed,
            failed_item_ids: self.failed_item_ids.clone(),
            summary: self.summary.clone(),
        }
    }
}

/// One pipeline stage.
///
/// Executors may run more than once for the same job (retries, crash recovery
/// before the checkpoint landed), so their side effects must be keyed by item id.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &StageContext,
        input: serde_json::Value,
    ) -> Result<StageResult, StageError>;
}

/// Poll bounds used while a stage waits for its fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanInPolling {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for FanInPolling {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
        }
    }
}

/// Handles a running stage gets from the orchestrator.
#[derive(Clone)]
pub struct StageContext {
    pub(crate) job_id: JobId,
    pub(crate) input: JobInput,
    pub(crate) stage_name: String,
    pub(crate) stage_index: usize,
    pub(crate) band: ProgressBand,
    pub(crate) queue: TaskQueue,
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) owner: RunnerId,
    pub(crate) polling: FanInPolling,
    pub(crate) task_max_attempts: u32,
}

impl StageContext {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn input(&self) -> &JobInput {
        &self.input
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn band(&self) -> ProgressBand {
        self.band
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Enqueue one task per `(item_id, payload)` using the default attempt budget.
    ///
    /// Re-running a stage re-enqueues the same items; existing tasks are kept.
    pub async fn fan_out<I>(&self, task_type: &str, items: I) -> Result<Vec<Task>, StageError>
    where
        I: IntoIterator<Item = (String, serde_json::Value)> + Send,
        I::IntoIter: Send,
    {
        self.fan_out_with(task_type, items, self.task_max_attempts)
            .await
    }

    pub async fn fan_out_with<I>(
        &self,
        task_type: &str,
        items: I,
        max_attempts: u32,
    ) -> Result<Vec<Task>, StageError>
    where
        I: IntoIterator<Item = (String, serde_json::Value)> + Send,
        I::IntoIter: Send,
    {
        let tasks = self
            .queue
            .enqueue_batch(self.job_id, task_type, items, max_attempts)
            .await?;
        tracing::info!(
            job_id = %self.job_id,
            stage = %self.stage_name,
            task_type,
            count = tasks.len(),
            "fan-out enqueued"
        );
        Ok(tasks)
    }

    /// Raise job progress to the point `done / total` through this stage's band.
    pub async fn report_progress(&self, done: usize, total: usize) -> Result<(), StageError> {
        self.jobs
            .record_progress(self.job_id, self.owner, self.band.at(done, total), Utc::now())
            .await?;
        Ok(())
    }

    /// Wait until every `task_type` task of this job is completed or dead-lettered.
    ///
    /// Polls with exponential backoff instead of holding a worker, and reports
    /// sub-progress inside the band as tasks settle.
    pub async fn await_fan_in(&self, task_type: &str) -> Result<FanInOutcome, StageError> {
        let mut delay = self.polling.initial;
        let mut last_terminal = None;
        loop {
            let status = self.queue.fan_in_status(self.job_id, task_type).await?;
            if last_terminal != Some(status.terminal()) {
                self.report_progress(status.terminal(), status.total).await?;
                last_terminal = Some(status.terminal());
            }
            if status.is_settled() {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2).min(self.polling.max);
        }

        let outcome = self.queue.fan_in_outcome(self.job_id, task_type).await?;
        tracing::info!(
            job_id = %self.job_id,
            stage = %self.stage_name,
            task_type,
            completed = outcome.completed,
            dead_lettered = outcome.dead_lettered,
            "fan-in settled"
        );
        Ok(outcome)
    }
}

/// A named stage with its band, executor and retry limits.
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub band: ProgressBand,
    pub executor: Arc<dyn StageExecutor>,
    /// Retries after the first attempt before the job fails.
    pub max_retries: u32,
    pub max_duration: Duration,
}

impl StageSpec {
    pub fn new(
        name: impl Into<String>,
        band: ProgressBand,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            band,
            executor,
            max_retries: 3,
            max_duration: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("band", &self.band)
            .field("max_retries", &self.max_retries)
            .field("max_duration", &self.max_duration)
            .finish_non_exhaustive()
    }
}

/// Ordered stages whose bands tile 0–100 without gaps.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    pub fn new(stages: Vec<StageSpec>) -> DomainResult<Self> {
        if stages.is_empty() {
            return Err(DomainError::validation("pipeline has no stages"));
        }

        let mut names = HashSet::new();
        let mut expected_start = 0u8;
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(DomainError::validation("stage name cannot be empty"));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(DomainError::validation(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            if stage.band.start() != expected_start {
                return Err(DomainError::invariant(format!(
                    "stage {} starts at {}% but the previous band ends at {}%",
                    stage.name,
                    stage.band.start(),
                    expected_start
                )));
            }
            expected_start = stage.band.end();
        }
        if expected_start != 100 {
            return Err(DomainError::invariant(format!(
                "pipeline bands end at {expected_start}%, not 100%"
            )));
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&StageSpec> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }
}
