//! Lease-based task queue with retry, backoff and dead-lettering.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ingest_core::{JobId, RunnerId, TaskId};

use crate::job::chrono_duration;
use crate::retry::RetryPolicy;
use crate::store::{FailDisposition, StoreError, TaskStore};
use crate::task::{
    DeadLetterReason, FanInStatus, Task, TaskFailure, TaskStats, TaskStatus,
};

/// Aggregate result of a settled fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanInOutcome {
    pub total: usize,
    pub completed: usize,
    pub dead_lettered: usize,
    /// Item ids of dead-lettered tasks, sorted.
    pub failed_item_ids: Vec<String>,
}

impl FanInOutcome {
    /// e.g. `"212/215 images embedded, 3 dead-lettered"`.
    pub fn summary(&self, noun: &str, verb: &str) -> String {
        let mut line = format!("{}/{} {noun} {verb}", self.completed, self.total);
        if self.dead_lettered > 0 {
            line.push_str(&format!(", {} dead-lettered", self.dead_lettered));
        }
        line
    }
}

/// Task queue over a [`TaskStore`].
///
/// Task failures are always turned into status transitions here; the only
/// errors callers see are storage and lease errors.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before a task that has been attempted `attempt_count` times is visible again.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        self.policy.delay_for_attempt(attempt_count)
    }

    /// Insert a pending task. Returns the existing task if the item was already enqueued.
    pub async fn enqueue(
        &self,
        job_id: JobId,
        task_type: &str,
        item_id: &str,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<Task, StoreError> {
        let task = self
            .store
            .enqueue(Task::new(job_id, task_type, item_id, payload, max_attempts))
            .await?;
        debug!(job_id = %job_id, task_id = %task.id, task_type, item_id, "task enqueued");
        Ok(task)
    }

    pub async fn enqueue_batch<I>(
        &self,
        job_id: JobId,
        task_type: &str,
        items: I,
        max_attempts: u32,
    ) -> Result<Vec<Task>, StoreError>
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let items: Vec<_> = items.into_iter().collect();
        let mut tasks = Vec::with_capacity(items.len());
        for (item_id, payload) in items {
            tasks.push(
                self.enqueue(job_id, task_type, &item_id, payload, max_attempts)
                    .await?,
            );
        }
        Ok(tasks)
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        self.store.get(task_id).await
    }

    /// Claim up to `batch_size` visible tasks of `task_type` for `lease`.
    pub async fn claim(
        &self,
        task_type: &str,
        batch_size: usize,
        lease: Duration,
        owner: RunnerId,
    ) -> Result<Vec<Task>, StoreError> {
        self.claim_at(task_type, batch_size, lease, owner, Utc::now())
            .await
    }

    pub async fn claim_at(
        &self,
        task_type: &str,
        batch_size: usize,
        lease: Duration,
        owner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let tasks = self
            .store
            .claim(task_type, batch_size, lease, owner, now)
            .await?;
        for task in &tasks {
            debug!(
                task_id = %task.id,
                job_id = %task.job_id,
                task_type,
                attempt = task.attempt_count,
                "task claimed"
            );
        }
        Ok(tasks)
    }

    /// Mark a claimed task completed with its result.
    pub async fn complete(
        &self,
        task: &Task,
        result: serde_json::Value,
    ) -> Result<Task, StoreError> {
        let token = task.lease_token.ok_or(StoreError::LeaseLost(task.id))?;
        let done = self
            .store
            .complete(task.id, token, result, Utc::now())
            .await?;
        debug!(task_id = %task.id, job_id = %task.job_id, "task completed");
        Ok(done)
    }

    /// Record a failed attempt: back off and retry, or dead-letter.
    pub async fn fail(&self, task: &Task, failure: TaskFailure) -> Result<Task, StoreError> {
        self.fail_at(task, failure, Utc::now()).await
    }

    pub async fn fail_at(
        &self,
        task: &Task,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let token = task.lease_token.ok_or(StoreError::LeaseLost(task.id))?;
        let disposition = self.disposition(task, &failure, now);
        let updated = self
            .store
            .fail(task.id, token, failure.message(), disposition, now)
            .await?;

        match disposition {
            FailDisposition::Retry { .. } if updated.status == TaskStatus::DeadLetter => warn!(
                task_id = %task.id,
                job_id = %task.job_id,
                item_id = %task.item_id,
                error = failure.message(),
                "task of cancelled job dead-lettered"
            ),
            FailDisposition::Retry { visible_at } => debug!(
                task_id = %task.id,
                job_id = %task.job_id,
                attempt = task.attempt_count,
                %visible_at,
                error = failure.message(),
                "task failed, retry scheduled"
            ),
            FailDisposition::DeadLetter(reason) => warn!(
                task_id = %task.id,
                job_id = %task.job_id,
                item_id = %task.item_id,
                attempt = task.attempt_count,
                reason = reason.as_str(),
                error = failure.message(),
                "task dead-lettered"
            ),
        }
        Ok(updated)
    }

    fn disposition(&self, task: &Task, failure: &TaskFailure, now: DateTime<Utc>) -> FailDisposition {
        match failure {
            TaskFailure::Fatal(_) => FailDisposition::DeadLetter(DeadLetterReason::Fatal),
            TaskFailure::Retryable { retry_after, .. } => {
                if task.attempt_count >= task.max_attempts {
                    return FailDisposition::DeadLetter(DeadLetterReason::Exhausted);
                }
                let delay = self
                    .backoff(task.attempt_count)
                    .max(retry_after.unwrap_or_default());
                FailDisposition::Retry {
                    visible_at: now + chrono_duration(delay),
                }
            }
        }
    }

    pub async fn fan_in_status(
        &self,
        job_id: JobId,
        task_type: &str,
    ) -> Result<FanInStatus, StoreError> {
        self.store.fan_in_status(job_id, task_type).await
    }

    pub async fn fan_in_outcome(
        &self,
        job_id: JobId,
        task_type: &str,
    ) -> Result<FanInOutcome, StoreError> {
        let status = self.fan_in_status(job_id, task_type).await?;
        let mut failed_item_ids: Vec<String> = self
            .store
            .list(job_id, Some(task_type), Some(TaskStatus::DeadLetter))
            .await?
            .into_iter()
            .map(|t| t.item_id)
            .collect();
        failed_item_ids.sort();

        Ok(FanInOutcome {
            total: status.total,
            completed: status.completed,
            dead_lettered: status.dead_lettered,
            failed_item_ids,
        })
    }

    /// Completed results keyed by item id, independent of completion order.
    pub async fn results(
        &self,
        job_id: JobId,
        task_type: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        Ok(self
            .store
            .list(job_id, Some(task_type), Some(TaskStatus::Completed))
            .await?
            .into_iter()
            .map(|t| (t.item_id, t.result.unwrap_or(serde_json::Value::Null)))
            .collect())
    }

    /// Dead-letter tasks whose final attempt's lease ran out.
    pub async fn reap_expired(&self) -> Result<Vec<Task>, StoreError> {
        let reaped = self.store.reap_expired(Utc::now()).await?;
        for task in &reaped {
            warn!(
                task_id = %task.id,
                job_id = %task.job_id,
                item_id = %task.item_id,
                attempt = task.attempt_count,
                "lease expired on final attempt, task dead-lettered"
            );
        }
        Ok(reaped)
    }

    pub async fn dead_letters(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        self.store
            .list(job_id, None, Some(TaskStatus::DeadLetter))
            .await
    }

    /// Move a dead-lettered task back to pending with a fresh attempt budget.
    pub async fn retry_dead_letter(&self, task_id: TaskId) -> Result<Task, StoreError> {
        let task = self.store.retry_dead_letter(task_id, Utc::now()).await?;
        info!(task_id = %task_id, job_id = %task.job_id, "dead-lettered task requeued");
        Ok(task)
    }

    /// Dead-letter the job's pending tasks with reason `cancelled`.
    ///
    /// Tasks already being processed are left to finish; if one of them then
    /// fails with a retryable error it is dead-lettered as `cancelled` too.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<usize, StoreError> {
        let cancelled = self.store.cancel_job(job_id, Utc::now()).await?;
        if cancelled > 0 {
            info!(job_id = %job_id, cancelled, "pending tasks cancelled");
        }
        Ok(cancelled)
    }

    pub async fn archive_completed(&self, job_id: JobId) -> Result<usize, StoreError> {
        self.store.archive_completed(job_id).await
    }

    pub async fn stats(&self, job_id: JobId) -> Result<TaskStats, StoreError> {
        self.store.stats(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryTaskStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn queue() -> TaskQueue {
        TaskQueue::new(
            InMemoryTaskStore::arc(),
            RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10)),
        )
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn retryable_failure_backs_off_then_dead_letters() {
        let queue = queue();
        let job_id = JobId::new();
        queue.enqueue(job_id, "embed", "img-1", json!({}), 2).await.unwrap();
        let owner = RunnerId::new();
        let now = Utc::now();

        let task = queue.claim_at("embed", 1, LEASE, owner, now).await.unwrap().remove(0);
        let retried = queue
            .fail_at(&task, TaskFailure::retryable("timeout"), now)
            .await
            .unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.visible_at, now + ChronoDuration::seconds(2));
        assert_eq!(retried.last_error.as_deref(), Some("timeout"));

        // Not visible until the backoff elapses.
        assert!(queue.claim_at("embed", 1, LEASE, owner, now).await.unwrap().is_empty());

        let later = now + ChronoDuration::seconds(2);
        let task = queue.claim_at("embed", 1, LEASE, owner, later).await.unwrap().remove(0);
        assert_eq!(task.attempt_count, 2);
        let dead = queue
            .fail_at(&task, TaskFailure::retryable("timeout again"), later)
            .await
            .unwrap();
        assert_eq!(dead.status, TaskStatus::DeadLetter);
        assert_eq!(dead.dead_letter_reason, Some(DeadLetterReason::Exhausted));
        assert!(dead.attempt_count >= dead.max_attempts);
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_immediately() {
        let queue = queue();
        let job_id = JobId::new();
        queue.enqueue(job_id, "embed", "img-1", json!({}), 5).await.unwrap();
        let task = queue
            .claim("embed", 1, LEASE, RunnerId::new())
            .await
            .unwrap()
            .remove(0);

        let dead = queue.fail(&task, TaskFailure::fatal("corrupt image")).await.unwrap();
        assert_eq!(dead.status, TaskStatus::DeadLetter);
        assert_eq!(dead.dead_letter_reason, Some(DeadLetterReason::Fatal));
        assert_eq!(dead.attempt_count, 1);
    }

    #[tokio::test]
    async fn retry_after_hint_extends_backoff() {
        let queue = queue();
        let job_id = JobId::new();
        queue.enqueue(job_id, "embed", "img-1", json!({}), 3).await.unwrap();
        let now = Utc::now();
        let task = queue
            .claim_at("embed", 1, LEASE, RunnerId::new(), now)
            .await
            .unwrap()
            .remove(0);

        let failure = TaskFailure::Retryable {
            message: "rate limited".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        let retried = queue.fail_at(&task, failure, now).await.unwrap();
        assert_eq!(retried.visible_at, now + ChronoDuration::seconds(7));
    }

    #[tokio::test]
    async fn outcome_and_results_are_keyed_by_item() {
        let queue = queue();
        let job_id = JobId::new();
        let owner = RunnerId::new();
        queue
            .enqueue_batch(
                job_id,
                "embed",
                vec![
                    ("b".to_string(), json!({})),
                    ("a".to_string(), json!({})),
                    ("c".to_string(), json!({})),
                ],
                1,
            )
            .await
            .unwrap();

        for task in queue.claim("embed", 10, LEASE, owner).await.unwrap() {
            if task.item_id == "c" {
                queue.fail(&task, TaskFailure::fatal("bad")).await.unwrap();
            } else {
                let result = json!({ "item": task.item_id });
                queue.complete(&task, result).await.unwrap();
            }
        }

        let outcome = queue.fan_in_outcome(job_id, "embed").await.unwrap();
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.failed_item_ids, vec!["c".to_string()]);
        assert_eq!(outcome.summary("images", "embedded"), "2/3 images embedded, 1 dead-lettered");

        let results = queue.results(job_id, "embed").await.unwrap();
        let keys: Vec<&str> = results.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn dead_letter_can_be_requeued() {
        let queue = queue();
        let job_id = JobId::new();
        queue.enqueue(job_id, "embed", "img-1", json!({}), 1).await.unwrap();
        let owner = RunnerId::new();
        let task = queue.claim("embed", 1, LEASE, owner).await.unwrap().remove(0);
        queue.fail(&task, TaskFailure::retryable("down")).await.unwrap();
        assert_eq!(queue.dead_letters(job_id).await.unwrap().len(), 1);

        let requeued = queue.retry_dead_letter(task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.attempt_count, 0);
        assert_eq!(queue.claim("embed", 1, LEASE, owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_job_only_touches_pending_tasks() {
        let queue = queue();
        let job_id = JobId::new();
        let owner = RunnerId::new();
        queue.enqueue(job_id, "embed", "in-flight", json!({}), 3).await.unwrap();
        let in_flight = queue.claim("embed", 1, LEASE, owner).await.unwrap().remove(0);
        queue.enqueue(job_id, "embed", "waiting", json!({}), 3).await.unwrap();

        assert_eq!(queue.cancel_job(job_id).await.unwrap(), 1);

        let dead = queue.dead_letters(job_id).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].item_id, "waiting");
        assert_eq!(dead[0].dead_letter_reason, Some(DeadLetterReason::Cancelled));

        // The in-flight task may still finish.
        queue.complete(&in_flight, json!({})).await.unwrap();
        let stats = queue.stats(job_id).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn in_flight_task_of_cancelled_job_is_not_requeued() {
        let queue = queue();
        let job_id = JobId::new();
        let owner = RunnerId::new();
        queue.enqueue(job_id, "embed", "img-1", json!({}), 3).await.unwrap();
        let in_flight = queue.claim("embed", 1, LEASE, owner).await.unwrap().remove(0);

        assert_eq!(queue.cancel_job(job_id).await.unwrap(), 0);
        let failed = queue
            .fail(&in_flight, TaskFailure::retryable("upstream 503"))
            .await
            .unwrap();

        assert_eq!(failed.status, TaskStatus::DeadLetter);
        assert_eq!(failed.dead_letter_reason, Some(DeadLetterReason::Cancelled));
        assert_eq!(failed.last_error.as_deref(), Some("upstream 503"));
        assert!(queue.claim("embed", 1, LEASE, owner).await.unwrap().is_empty());

        // Other jobs keep retrying as usual.
        let other = JobId::new();
        queue.enqueue(other, "embed", "img-1", json!({}), 3).await.unwrap();
        let task = queue.claim("embed", 1, LEASE, owner).await.unwrap().remove(0);
        let retried = queue.fail(&task, TaskFailure::retryable("upstream 503")).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
    }
}
