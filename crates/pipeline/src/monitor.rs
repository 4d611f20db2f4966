//! Stuck-job detection and bounded auto-recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use ingest_core::JobId;

use crate::job::{JobStatus, chrono_duration};
use crate::orchestrator::{DriveHandle, OrchestratorError, PipelineOrchestrator};
use crate::store::{JobFilter, JobStore};

/// Monitor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Heartbeat age after which a running job is presumed crashed.
    pub stuck_threshold: Duration,
    /// Recoveries allowed before a job is failed permanently.
    pub max_restarts: u32,
    /// Jobs examined per scan and category.
    pub batch_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(120),
            max_restarts: 3,
            batch_limit: 100,
        }
    }
}

/// What one scan did.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Stuck or never-started jobs taken over and resumed.
    pub resumed: Vec<JobId>,
    /// Jobs failed permanently because their restarts ran out.
    pub failed: Vec<JobId>,
    /// Paused jobs whose retry delay had elapsed and that no drive picked up.
    pub retried: Vec<JobId>,
    /// Tasks dead-lettered because their final lease expired.
    pub reaped_tasks: usize,
    /// Background drives started by this scan.
    pub handles: Vec<DriveHandle>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty()
            && self.failed.is_empty()
            && self.retried.is_empty()
            && self.reaped_tasks == 0
    }

    /// Wait for every drive the scan started.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "recovered job drive failed"),
                Err(e) => error!(error = %e, "recovered job drive panicked"),
            }
        }
    }
}

/// Periodic scanner for stuck jobs.
#[derive(Clone)]
pub struct JobMonitor {
    orchestrator: PipelineOrchestrator,
    jobs: Arc<dyn JobStore>,
    config: MonitorConfig,
}

impl JobMonitor {
    pub fn new(
        orchestrator: PipelineOrchestrator,
        jobs: Arc<dyn JobStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            orchestrator,
            jobs,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// One pass: recover stale jobs, continue due retries, reap expired leases.
    pub async fn scan(&self) -> Result<ScanReport, OrchestratorError> {
        let now = Utc::now();
        let stale_before = now - chrono_duration(self.config.stuck_threshold);
        let mut report = ScanReport::default();

        let stale = self
            .jobs
            .list(
                &JobFilter::stale(vec![JobStatus::Running, JobStatus::Pending], stale_before)
                    .limit(self.config.batch_limit),
            )
            .await?;
        for candidate in stale {
            let Some(mut job) = self.orchestrator.take_over(candidate.id, stale_before).await?
            else {
                debug!(job_id = %candidate.id, "job recovered elsewhere");
                continue;
            };

            if job.status == JobStatus::Running {
                job.restart_count += 1;
            }
            if job.restart_count > self.config.max_restarts {
                let msg = format!(
                    "job stuck in stage {} and exceeded {} restarts",
                    job.current_stage.as_deref().unwrap_or("unknown"),
                    self.config.max_restarts
                );
                let id = job.id;
                self.orchestrator.fail_owned(job, msg).await?;
                report.failed.push(id);
                continue;
            }

            warn!(
                job_id = %job.id,
                status = %job.status,
                stage = ?job.current_stage,
                restart_count = job.restart_count,
                last_seen = %candidate.last_seen(),
                "recovering stuck job"
            );
            report.resumed.push(job.id);
            report.handles.push(self.orchestrator.continue_owned(&job).await?);
        }

        let due = self
            .jobs
            .list(&JobFilter::retry_due(self.retry_due_by(now)).limit(self.config.batch_limit))
            .await?;
        for job in due {
            debug!(job_id = %job.id, "retry delay elapsed");
            report.retried.push(job.id);
            report.handles.push(self.orchestrator.spawn_drive(job.id, None));
        }

        report.reaped_tasks = self.orchestrator.queue().reap_expired().await?.len();

        if !report.is_empty() {
            info!(
                resumed = report.resumed.len(),
                failed = report.failed.len(),
                retried = report.retried.len(),
                reaped_tasks = report.reaped_tasks,
                "monitor scan"
            );
        }
        Ok(report)
    }

    /// Cutoff for continuing paused jobs. With autostart the pausing runner
    /// already has a delayed drive queued, so the monitor only steps in once a
    /// retry is a full interval overdue.
    fn retry_due_by(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.orchestrator.config().autostart {
            now - chrono_duration(self.config.interval)
        } else {
            now
        }
    }

    /// Run [`scan`](Self::scan) every interval until the handle is shut down.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            info!(interval = ?self.config.interval, "job monitor started");
            let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("job monitor received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan().await {
                            error!(error = %e, "monitor scan failed");
                        }
                    }
                }
            }
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a running monitor loop.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "monitor task panicked");
        }
    }
}
