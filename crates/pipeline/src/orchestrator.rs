//! Pipeline orchestration: stage sequencing, checkpoints, retries and resume.
//!
//! A job is driven by whichever runner holds its ownership. Every job write is
//! fenced on that ownership, so two runners never execute stages of the same
//! job concurrently, and a runner that was declared dead stops at its next
//! write instead of clobbering the one that took over.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use ingest_core::{DomainError, JobId, RunnerId};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::job::{Job, JobInput, JobStatus, JobStatusView, chrono_duration};
use crate::queue::TaskQueue;
use crate::retry::RetryPolicy;
use crate::stage::{FanInPolling, PipelineDefinition, StageContext, StageError, StageResult, StageSpec};
use crate::store::{JobFilter, JobStore, StoreError};

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Heartbeat cadence while a stage runs.
    pub heartbeat_interval: Duration,
    /// Backoff between retries of a failed stage.
    pub stage_retry: RetryPolicy,
    /// Attempt budget for fan-out tasks.
    pub task_max_attempts: u32,
    pub fan_in: FanInPolling,
    /// Start driving jobs in the background on submit and after a retry delay.
    pub autostart: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stage_retry: RetryPolicy::exponential(3, Duration::from_secs(5), Duration::from_secs(300)),
            task_max_attempts: 3,
            fan_in: FanInPolling::default(),
            autostart: true,
        }
    }
}

impl OrchestratorConfig {
    /// Heartbeats older than this mark a job as abandoned for takeover on startup.
    pub fn takeover_after(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(2)
    }
}

/// Result of one [`PipelineOrchestrator::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// A stage completed and checkpointed; `next_stage` runs next.
    Continued { next_stage: usize },
    /// A retryable failure paused the job until `retry_at`.
    Paused { retry_at: DateTime<Utc> },
    /// The job is terminal.
    Finished(JobStatus),
    /// Another live runner owns the job.
    Busy,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => Self::JobNotFound(id),
            other => Self::Store(other),
        }
    }
}

pub type DriveHandle = JoinHandle<Result<Advance, OrchestratorError>>;

struct Inner {
    jobs: Arc<dyn JobStore>,
    checkpoints: CheckpointStore,
    queue: TaskQueue,
    pipeline: PipelineDefinition,
    config: OrchestratorConfig,
    runner_id: RunnerId,
}

/// Sequences a [`PipelineDefinition`] over jobs.
///
/// Cheap to clone; clones share one runner identity.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl PipelineOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: TaskQueue,
        pipeline: PipelineDefinition,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                checkpoints: CheckpointStore::new(jobs.clone()),
                jobs,
                queue,
                pipeline,
                config,
                runner_id: RunnerId::new(),
            }),
        }
    }

    pub fn runner_id(&self) -> RunnerId {
        self.inner.runner_id
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.inner.pipeline
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.inner.checkpoints
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Validate and persist a new job. With autostart, stage 0 starts in the background.
    pub async fn submit(&self, input: JobInput) -> Result<JobId, OrchestratorError> {
        input.validate()?;
        let job = Job::new(input);
        self.inner.jobs.insert(&job).await?;
        info!(job_id = %job.id, document_ref = %job.document_ref(), "job submitted");

        if self.inner.config.autostart {
            self.spawn_drive(job.id, None);
        }
        Ok(job.id)
    }

    /// Run the next stage of the job, if this runner can own it.
    pub async fn advance(&self, job_id: JobId) -> Result<Advance, OrchestratorError> {
        self.advance_from(job_id, self.takeover_cutoff()).await
    }

    /// Advance repeatedly until the job is terminal, paused, or owned elsewhere.
    pub async fn drive(&self, job_id: JobId) -> Result<Advance, OrchestratorError> {
        self.drive_from(job_id, self.takeover_cutoff()).await
    }

    /// Continue a job after a crash, taking it over from whichever runner held it.
    ///
    /// Stages with a checkpoint are never executed again.
    pub async fn resume(&self, job_id: JobId) -> Result<Advance, OrchestratorError> {
        info!(job_id = %job_id, runner = %self.runner_id(), "resuming job");
        self.drive_from(job_id, DateTime::<Utc>::MAX_UTC).await
    }

    /// Resume every non-terminal job whose runner has gone quiet. Called on startup.
    pub async fn resume_all(&self) -> Result<Vec<(JobId, DriveHandle)>, OrchestratorError> {
        let now = Utc::now();
        let cutoff = self.takeover_cutoff();
        let jobs = self
            .inner
            .jobs
            .list(&JobFilter::with_statuses(JobStatus::NON_TERMINAL.to_vec()))
            .await?;

        let mut handles = Vec::new();
        for job in jobs {
            let delay = match job.status {
                JobStatus::PausedRetry => job
                    .retry_at
                    .and_then(|at| (at - now).to_std().ok()),
                _ if job.owner.is_some() && job.last_seen() >= cutoff => continue,
                _ => None,
            };
            if delay.is_some() && !self.inner.config.autostart {
                continue;
            }
            debug!(job_id = %job.id, status = %job.status, ?delay, "scheduling resume");
            handles.push((job.id, self.spawn_drive(job.id, delay)));
        }
        info!(count = handles.len(), "resuming unfinished jobs");
        Ok(handles)
    }

    /// Cancel a job. Pending and paused jobs stop at once; running jobs stop at
    /// the next stage boundary. The job's pending tasks are dead-lettered.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatusView, OrchestratorError> {
        let job = self
            .inner
            .jobs
            .request_cancel(job_id, Utc::now())
            .await
            .map_err(OrchestratorError::from_store)?;
        let tasks = self.inner.queue.cancel_job(job_id).await?;
        info!(job_id = %job_id, status = %job.status, cancelled_tasks = tasks, "job cancel requested");
        Ok(JobStatusView::from(&job))
    }

    /// Current status snapshot. Never waits on in-flight work.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatusView, OrchestratorError> {
        let job = self.load(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        self.load(job_id).await
    }

    /// Spawn `drive` in the background, optionally after `delay`.
    pub fn spawn_drive(&self, job_id: JobId, delay: Option<Duration>) -> DriveHandle {
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let result = this.drive(job_id).await;
            if let Err(e) = &result {
                error!(job_id = %job_id, error = %e, "background drive failed");
            }
            result
        })
    }

    /// Take a stale job over for recovery. `None` if it is terminal or still live.
    pub(crate) async fn take_over(
        &self,
        job_id: JobId,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Job>, OrchestratorError> {
        self.inner
            .jobs
            .acquire(job_id, self.runner_id(), Utc::now(), stale_before)
            .await
            .map_err(OrchestratorError::from_store)
    }

    /// Persist a job this runner owns and keep driving it in the background.
    pub(crate) async fn continue_owned(&self, job: &Job) -> Result<DriveHandle, OrchestratorError> {
        self.inner.jobs.update(job, self.runner_id()).await?;
        Ok(self.spawn_drive(job.id, None))
    }

    /// Permanently fail a job this runner owns.
    pub(crate) async fn fail_owned(&self, mut job: Job, error: String) -> Result<(), OrchestratorError> {
        error!(job_id = %job.id, error = %error, "job failed");
        job.mark_failed(error);
        self.inner.jobs.update(&job, self.runner_id()).await?;
        Ok(())
    }

    fn takeover_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono_duration(self.inner.config.takeover_after())
    }

    async fn load(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        self.inner
            .jobs
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    async fn drive_from(
        &self,
        job_id: JobId,
        stale_before: DateTime<Utc>,
    ) -> Result<Advance, OrchestratorError> {
        let mut step = self.advance_from(job_id, stale_before).await?;
        while let Advance::Continued { .. } = step {
            step = self.advance(job_id).await?;
        }
        Ok(step)
    }

    async fn advance_from(
        &self,
        job_id: JobId,
        stale_before: DateTime<Utc>,
    ) -> Result<Advance, OrchestratorError> {
        match self.try_advance(job_id, stale_before).await {
            Err(OrchestratorError::Store(StoreError::OwnershipLost(_))) => {
                warn!(job_id = %job_id, runner = %self.runner_id(), "job taken over by another runner");
                Ok(Advance::Busy)
            }
            other => other,
        }
    }

    async fn try_advance(
        &self,
        job_id: JobId,
        stale_before: DateTime<Utc>,
    ) -> Result<Advance, OrchestratorError> {
        let runner = self.runner_id();
        let now = Utc::now();

        let current = self.load(job_id).await?;
        if current.status.is_terminal() {
            return Ok(Advance::Finished(current.status));
        }
        if let Some(retry_at) = pending_retry(&current, now) {
            return Ok(Advance::Paused { retry_at });
        }

        let Some(mut job) = self
            .inner
            .jobs
            .acquire(job_id, runner, now, stale_before)
            .await
            .map_err(OrchestratorError::from_store)?
        else {
            let job = self.load(job_id).await?;
            if job.status.is_terminal() {
                return Ok(Advance::Finished(job.status));
            }
            debug!(job_id = %job_id, owner = ?job.owner, "job busy");
            return Ok(Advance::Busy);
        };

        if job.cancel_requested {
            return self.finish_cancelled(job).await;
        }

        let latest = self.inner.checkpoints.latest(job_id).await?;
        let next = latest.as_ref().map_or(0, |c| c.stage_index + 1);
        let Some(stage) = self.inner.pipeline.stage(next).cloned() else {
            // Crashed between the last checkpoint and completion.
            return self.finish_completed(job).await;
        };
        let input = match latest {
            Some(checkpoint) => checkpoint.state_blob,
            None => serde_json::to_value(&job.input)?,
        };

        job.mark_running(&stage.name);
        job.last_heartbeat_at = Some(now);
        self.inner.jobs.update(&job, runner).await?;
        info!(
            job_id = %job_id,
            stage = %stage.name,
            stage_index = next,
            attempt = job.stage_attempts + 1,
            "stage started"
        );

        let ctx = StageContext {
            job_id,
            input: job.input.clone(),
            stage_name: stage.name.clone(),
            stage_index: next,
            band: stage.band,
            queue: self.inner.queue.clone(),
            jobs: self.inner.jobs.clone(),
            owner: runner,
            polling: self.inner.config.fan_in,
            task_max_attempts: self.inner.config.task_max_attempts,
        };

        match self.run_stage(&ctx, &stage, input).await {
            Ok(result) => self.on_stage_success(job_id, next, &stage, result).await,
            Err(e) if e.is_ownership_lost() => Err(OrchestratorError::Store(StoreError::OwnershipLost(job_id))),
            Err(e) => self.on_stage_failure(job_id, &stage, e).await,
        }
    }

    /// Execute the stage under its max duration, heartbeating while it runs.
    async fn run_stage(
        &self,
        ctx: &StageContext,
        stage: &StageSpec,
        input: serde_json::Value,
    ) -> Result<StageResult, StageError> {
        let execution = tokio::time::timeout(stage.max_duration, stage.executor.execute(ctx, input));
        tokio::pin!(execution);

        let period = self.inner.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                outcome = &mut execution => {
                    return outcome.unwrap_or(Err(StageError::Timeout(stage.max_duration)));
                }
                _ = heartbeat.tick() => {
                    match self.inner.checkpoints.heartbeat(ctx.job_id, ctx.owner).await {
                        Ok(()) => debug!(job_id = %ctx.job_id, stage = %stage.name, "heartbeat"),
                        Err(e @ StoreError::OwnershipLost(_)) => return Err(e.into()),
                        Err(e) => warn!(job_id = %ctx.job_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    }

    async fn on_stage_success(
        &self,
        job_id: JobId,
        index: usize,
        stage: &StageSpec,
        result: StageResult,
    ) -> Result<Advance, OrchestratorError> {
        let mut job = self.load(job_id).await?;
        let checkpoint = Checkpoint::new(job_id, &stage.name, index, result.output.clone());
        job.mark_stage_done(result.report(&stage.name), stage.band.end());
        self.inner
            .checkpoints
            .save(&job, self.runner_id(), &checkpoint)
            .await?;
        info!(
            job_id = %job_id,
            stage = %stage.name,
            progress = job.progress_percent,
            processed = result.processed,
            failed_items = result.failed_item_ids.len(),
            "stage completed"
        );

        if index + 1 >= self.inner.pipeline.len() {
            return self.finish_completed(job).await;
        }
        if job.cancel_requested {
            return self.finish_cancelled(job).await;
        }
        Ok(Advance::Continued {
            next_stage: index + 1,
        })
    }

    async fn on_stage_failure(
        &self,
        job_id: JobId,
        stage: &StageSpec,
        err: StageError,
    ) -> Result<Advance, OrchestratorError> {
        let mut job = self.load(job_id).await?;

        if !err.is_retryable() {
            self.fail_owned(job, format!("stage {} failed: {err}", stage.name))
                .await?;
            return Ok(Advance::Finished(JobStatus::Failed));
        }
        if job.cancel_requested {
            return self.finish_cancelled(job).await;
        }
        if job.stage_attempts >= stage.max_retries {
            let msg = format!(
                "stage {} failed after {} retries: {err}",
                stage.name, job.stage_attempts
            );
            self.fail_owned(job, msg).await?;
            return Ok(Advance::Finished(JobStatus::Failed));
        }

        let delay = self.inner.config.stage_retry.delay_for_attempt(job.stage_attempts);
        job.stage_attempts += 1;
        let retry_at = Utc::now() + chrono_duration(delay);
        warn!(
            job_id = %job_id,
            stage = %stage.name,
            attempt = job.stage_attempts,
            %retry_at,
            error = %err,
            "stage failed, retry scheduled"
        );
        job.mark_paused(retry_at, err.to_string());
        self.inner.jobs.update(&job, self.runner_id()).await?;

        if self.inner.config.autostart {
            self.spawn_drive(job_id, Some(delay));
        }
        Ok(Advance::Paused { retry_at })
    }

    async fn finish_completed(&self, mut job: Job) -> Result<Advance, OrchestratorError> {
        job.mark_completed();
        self.inner.jobs.update(&job, self.runner_id()).await?;
        let archived = self.inner.queue.archive_completed(job.id).await?;
        info!(
            job_id = %job.id,
            warnings = job.report.has_warnings(),
            failed_items = job.report.failed_count(),
            archived_tasks = archived,
            summary = job.report.summary().unwrap_or_default(),
            "job completed"
        );
        Ok(Advance::Finished(JobStatus::Completed))
    }

    async fn finish_cancelled(&self, mut job: Job) -> Result<Advance, OrchestratorError> {
        job.mark_cancelled();
        self.inner.jobs.update(&job, self.runner_id()).await?;
        self.inner.queue.cancel_job(job.id).await?;
        info!(job_id = %job.id, stage = ?job.current_stage, "job cancelled");
        Ok(Advance::Finished(JobStatus::Cancelled))
    }
}

fn pending_retry(job: &Job, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match (job.status, job.retry_at) {
        (JobStatus::PausedRetry, Some(at)) if at > now && !job.cancel_requested => Some(at),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryJobStore, InMemoryTaskStore};
    use crate::stage::{ProgressBand, StageExecutor};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with the queued errors first, then succeeds.
    #[derive(Default)]
    struct Scripted {
        failures: Mutex<VecDeque<StageError>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn failing(errors: Vec<StageError>) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(errors.into()),
                ..Default::default()
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay: Some(delay),
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageExecutor for Scripted {
        async fn execute(
            &self,
            ctx: &StageContext,
            input: serde_json::Value,
        ) -> Result<StageResult, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(StageResult::new(json!({ "after": ctx.stage_name(), "input": input })))
        }
    }

    fn orchestrator(stages: Vec<StageSpec>) -> PipelineOrchestrator {
        let config = OrchestratorConfig {
            heartbeat_interval: Duration::from_millis(10),
            stage_retry: RetryPolicy::fixed(3, Duration::ZERO),
            autostart: false,
            ..Default::default()
        };
        PipelineOrchestrator::new(
            InMemoryJobStore::arc(),
            TaskQueue::new(InMemoryTaskStore::arc(), RetryPolicy::default()),
            PipelineDefinition::new(stages).unwrap(),
            config,
        )
    }

    fn two_stages(first: Arc<Scripted>, second: Arc<Scripted>) -> Vec<StageSpec> {
        vec![
            StageSpec::new("first", ProgressBand::new(0, 40).unwrap(), first),
            StageSpec::new("second", ProgressBand::new(40, 100).unwrap(), second),
        ]
    }

    #[tokio::test]
    async fn submit_rejects_invalid_input() {
        let orch = orchestrator(two_stages(Scripted::failing(vec![]), Scripted::failing(vec![])));
        let err = orch.submit(JobInput::new("")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn stages_chain_outputs_and_complete() {
        let orch = orchestrator(two_stages(Scripted::failing(vec![]), Scripted::failing(vec![])));
        let job_id = orch.submit(JobInput::new("doc.pdf")).await.unwrap();

        assert_eq!(
            orch.advance(job_id).await.unwrap(),
            Advance::Continued { next_stage: 1 }
        );
        let status = orch.get_status(job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Running);
        assert_eq!(status.progress_percent, 40);

        assert_eq!(
            orch.advance(job_id).await.unwrap(),
            Advance::Finished(JobStatus::Completed)
        );
        let last = orch.checkpoints().latest(job_id).await.unwrap().unwrap();
        assert_eq!(last.stage_name, "second");
        assert_eq!(last.state_blob["input"]["after"], "first");
        assert_eq!(last.state_blob["input"]["input"]["document_ref"], "doc.pdf");

        let status = orch.get_status(job_id).await.unwrap();
        assert_eq!(status.progress_percent, 100);
        assert!(!status.completed_with_warnings);
    }

    #[tokio::test]
    async fn retryable_failure_pauses_then_retries() {
        let first = Scripted::failing(vec![StageError::retryable("provider timeout")]);
        let orch = orchestrator(two_stages(first.clone(), Scripted::failing(vec![])));
        let job_id = orch.submit(JobInput::new("doc.pdf")).await.unwrap();

        assert!(matches!(orch.advance(job_id).await.unwrap(), Advance::Paused { .. }));
        let job = orch.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::PausedRetry);
        assert_eq!(job.stage_attempts, 1);
        assert_eq!(job.owner, None);
        assert!(job.error.as_deref().unwrap().contains("provider timeout"));

        assert_eq!(
            orch.drive(job_id).await.unwrap(),
            Advance::Finished(JobStatus::Completed)
        );
        assert_eq!(first.calls(), 2);
        assert_eq!(orch.get_job(job_id).await.unwrap().stage_attempts, 0);
    }

    #[tokio::test]
    async fn fatal_failure_fails_job_without_retry() {
        let first = Scripted::failing(vec![StageError::fatal("unparseable pdf")]);
        let orch = orchestrator(two_stages(first.clone(), Scripted::failing(vec![])));
        let job_id = orch.submit(JobInput::new("doc.pdf")).await.unwrap();

        assert_eq!(
            orch.drive(job_id).await.unwrap(),
            Advance::Finished(JobStatus::Failed)
        );
        let status = orch.get_status(job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert!(status.error.unwrap().contains("stage first failed"));
        assert_eq!(first.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_stage_retries_fail_the_job() {
        let first = Scripted::failing(vec![
            StageError::retryable("one"),
            StageError::retryable("two"),
        ]);
        let stages = vec![
            StageSpec::new("first", ProgressBand::new(0, 100).unwrap(), first.clone())
                .with_max_retries(1),
        ];
        let orch = orchestrator(stages);
        let job_id = orch.submit(JobInput::new("doc.pdf")).await.unwrap();

        assert!(matches!(orch.advance(job_id).await.unwrap(), Advance::Paused { .. }));
        assert_eq!(
            orch.advance(job_id).await.unwrap(),
            Advance::Finished(JobStatus::Failed)
        );
        let error = orch.get_status(job_id).await.unwrap().error.unwrap();
        assert!(error.contains("after 1 retries"), "{error}");
    }

    #[tokio::test]
    async fn stage_timeout_is_retryable() {
        let slow = Scripted::slow(Duration::from_secs(3600));
        let stages = vec![
            StageSpec::new("slow", ProgressBand::new(0, 100).unwrap(), slow)
                .with_max_duration(Duration::from_millis(30)),
        ];
        let orch = orchestrator(stages);
        let job_id = orch.submit(JobInput::new("doc.pdf")).await.unwrap();

        assert!(matches!(orch.advance(job_id).await.unwrap(), Advance::Paused { .. }));
        let job = orch.get_job(job_id).await.unwrap();
        assert!(job.error.unwrap().contains("max duration"));
        // Heartbeats were written while the stage ran.
        assert!(job.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn live_owner_makes_other_runners_busy() {
        let jobs = InMemoryJobStore::arc();
        let queue = TaskQueue::new(InMemoryTaskStore::arc(), RetryPolicy::default());
        let config = OrchestratorConfig {
            autostart: false,
            ..Default::default()
        };
        let pipeline = PipelineDefinition::new(two_stages(
            Scripted::failing(vec![]),
            Scripted::failing(vec![]),
        ))
        .unwrap();
        let a = PipelineOrchestrator::new(jobs.clone(), queue.clone(), pipeline.clone(), config.clone());
        let b = PipelineOrchestrator::new(jobs.clone(), queue, pipeline, config);

        let job_id = a.submit(JobInput::new("doc.pdf")).await.unwrap();
        a.advance(job_id).await.unwrap();
        assert_eq!(b.advance(job_id).await.unwrap(), Advance::Busy);

        // A forced resume takes over; the old runner is fenced out.
        assert_eq!(
            b.resume(job_id).await.unwrap(),
            Advance::Finished(JobStatus::Completed)
        );
        assert_eq!(
            a.advance(job_id).await.unwrap(),
            Advance::Finished(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn cancel_of_unstarted_job_is_immediate() {
        let orch = orchestrator(two_stages(Scripted::failing(vec![]), Scripted::failing(vec![])));
        let job_id = orch.submit(JobInput::new("doc.pdf")).await.unwrap();

        let view = orch.cancel(job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(
            orch.advance(job_id).await.unwrap(),
            Advance::Finished(JobStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let orch = orchestrator(two_stages(Scripted::failing(vec![]), Scripted::failing(vec![])));
        let missing = JobId::new();
        assert!(matches!(
            orch.get_status(missing).await,
            Err(OrchestratorError::JobNotFound(id)) if id == missing
        ));
        assert!(matches!(
            orch.cancel(missing).await,
            Err(OrchestratorError::JobNotFound(_))
        ));
    }
}
