//! Bounded worker pools that drain the task queue per task type.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ingest_core::RunnerId;

use crate::queue::TaskQueue;
use crate::store::StoreError;
use crate::task::{Task, TaskFailure, TaskStatus};

/// Executes one claimed task.
///
/// Tasks are delivered at least once, so handlers must tolerate re-execution
/// for the same item.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskFailure>;
}

/// Worker configuration for one task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Concurrent workers; bounds calls into rate-limited providers.
    pub concurrency: usize,
    /// Tasks claimed per poll by each worker. The batch shares one lease and is
    /// run in order, so later tasks get whatever lease time is left.
    pub batch_size: usize,
    pub lease_duration: Duration,
    /// Idle sleep when a poll returns nothing.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            batch_size: 1,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lease time kept back for recording the outcome.
    pub fn record_margin(&self) -> Duration {
        self.lease_duration / 10
    }

    /// Time a handler may run for a task whose lease ends at `lease_until`:
    /// the remaining lease minus the record margin. `None` when nothing is left.
    pub fn handler_budget(
        &self,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let remaining = (lease_until - now).to_std().ok()?;
        let budget = remaining.checked_sub(self.record_margin())?;
        (!budget.is_zero()).then_some(budget)
    }
}

/// Counters across all workers of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Results dropped because the lease had expired or moved on.
    pub lost_leases: u64,
    /// Claimed tasks left unstarted because too little of the lease remained.
    pub skipped: u64,
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn bump(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    let mut guard = match stats.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard);
}

struct Registration {
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
}

/// Worker pool builder.
pub struct WorkerPool {
    queue: TaskQueue,
    registrations: BTreeMap<String, Registration>,
}

impl WorkerPool {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            queue,
            registrations: BTreeMap::new(),
        }
    }

    /// Register the handler for `task_type`. A later registration replaces an earlier one.
    pub fn register(
        mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        config: WorkerConfig,
    ) -> Self {
        self.registrations
            .insert(task_type.into(), Registration { handler, config });
        self
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.registrations.keys().map(String::as_str)
    }

    /// Spawn `concurrency` workers for each registered task type.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = SharedStats::default();
        let mut joins = Vec::new();

        for (task_type, registration) in self.registrations {
            let concurrency = registration.config.concurrency.max(1);
            info!(task_type = %task_type, concurrency, "starting workers");
            for index in 0..concurrency {
                let worker = Worker {
                    task_type: task_type.clone(),
                    index,
                    owner: RunnerId::new(),
                    queue: self.queue.clone(),
                    handler: registration.handler.clone(),
                    config: registration.config.clone(),
                    stats: stats.clone(),
                };
                joins.push(tokio::spawn(worker.run(shutdown_rx.clone())));
            }
        }

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }
}

/// Handle to a running worker pool.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: SharedStats,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> WorkerStats {
        match self.stats.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Signal shutdown and wait for workers to finish their current batch.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

struct Worker {
    task_type: String,
    index: usize,
    owner: RunnerId,
    queue: TaskQueue,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    stats: SharedStats,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(task_type = %self.task_type, worker = self.index, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = self.run_once().await;
            if processed == 0 {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        debug!(task_type = %self.task_type, worker = self.index, "worker stopped");
    }

    async fn run_once(&self) -> usize {
        let tasks = match self
            .queue
            .claim(
                &self.task_type,
                self.config.batch_size,
                self.config.lease_duration,
                self.owner,
            )
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(task_type = %self.task_type, error = %e, "claim failed");
                return 0;
            }
        };

        let count = tasks.len();
        bump(&self.stats, |s| s.claimed += count as u64);
        for task in tasks {
            self.process(task).await;
        }
        count
    }

    async fn process(&self, task: Task) {
        // Starting past the lease would race the task's next delivery.
        let Some(budget) = self.config.handler_budget(task.visible_at, Utc::now()) else {
            debug!(task_id = %task.id, task_type = %self.task_type, "lease nearly spent, task left for redelivery");
            bump(&self.stats, |s| s.skipped += 1);
            return;
        };
        let outcome = match tokio::time::timeout(budget, self.handler.execute(&task)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskFailure::retryable(format!(
                "handler exceeded lease of {:?}",
                self.config.lease_duration
            ))),
        };

        let written = match outcome {
            Ok(result) => self.queue.complete(&task, result).await,
            Err(failure) => self.queue.fail(&task, failure).await,
        };

        match written {
            Ok(updated) => bump(&self.stats, |s| match updated.status {
                TaskStatus::Completed => s.completed += 1,
                TaskStatus::DeadLetter => s.dead_lettered += 1,
                TaskStatus::Pending | TaskStatus::Processing => s.retried += 1,
            }),
            Err(StoreError::LeaseLost(_)) => {
                warn!(task_id = %task.id, task_type = %self.task_type, "lease lost before result was recorded");
                bump(&self.stats, |s| s.lost_leases += 1);
            }
            Err(e) => {
                // The lease will expire and the task will be redelivered.
                error!(task_id = %task.id, task_type = %self.task_type, error = %e, "failed to record task outcome");
            }
        }
    }
}
