//! In-memory stores for tests and single-process development.
//!
//! Each store keeps all of its tables behind one mutex, which gives the same
//! atomicity the durable stores get from transactions and row locks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ingest_core::{JobId, LeaseToken, RunnerId, TaskId};

use crate::checkpoint::Checkpoint;
use crate::content::{
    ChunkRecord, ContentError, ContentFilter, ContentItem, ContentKind, ContentStore,
    EmbeddingKind, ImageRecord, ProductRecord, RelationshipRecord,
};
use crate::job::{Job, JobStatus, chrono_duration};
use crate::store::{FailDisposition, JobFilter, JobStore, StoreError, TaskStore};
use crate::task::{DeadLetterReason, FanInStatus, Task, TaskStats, TaskStatus};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::storage("in-memory store lock poisoned"))
}

#[derive(Debug, Default)]
struct JobTables {
    jobs: HashMap<JobId, Job>,
    checkpoints: HashMap<JobId, Vec<Checkpoint>>,
}

impl JobTables {
    fn owned_mut(&mut self, job_id: JobId, owner: RunnerId) -> Result<&mut Job, StoreError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.owner != Some(owner) {
            return Err(StoreError::OwnershipLost(job_id));
        }
        Ok(job)
    }
}

/// Apply `update` over `stored`, keeping progress and cancellation monotonic.
fn merge_job(stored: &mut Job, update: &Job) {
    let progress = stored.progress_percent.max(update.progress_percent);
    let cancel_requested = stored.cancel_requested || update.cancel_requested;
    *stored = update.clone();
    stored.progress_percent = progress;
    stored.cancel_requested = cancel_requested;
}

/// In-memory job and checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<JobTables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut tables = lock(&self.inner)?;
        if tables.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job already exists: {}", job.id)));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(lock(&self.inner)?.jobs.get(&job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let tables = lock(&self.inner)?;
        let mut result: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn acquire(
        &self,
        job_id: JobId,
        owner: RunnerId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut tables = lock(&self.inner)?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            return Ok(None);
        }
        let free = match job.owner {
            None => true,
            Some(current) if current == owner => true,
            Some(_) => job.last_seen() < stale_before,
        };
        if !free {
            return Ok(None);
        }

        job.owner = Some(owner);
        job.last_heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update(&self, job: &Job, owner: RunnerId) -> Result<(), StoreError> {
        let mut tables = lock(&self.inner)?;
        let stored = tables.owned_mut(job.id, owner)?;
        merge_job(stored, job);
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        job: &Job,
        checkpoint: &Checkpoint,
        owner: RunnerId,
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.inner)?;
        tables.owned_mut(job.id, owner)?;

        let existing = tables.checkpoints.entry(job.id).or_default();
        if existing
            .iter()
            .any(|c| c.stage_index == checkpoint.stage_index)
        {
            return Err(StoreError::Conflict(format!(
                "checkpoint for stage {} of job {} already exists",
                checkpoint.stage_index, job.id
            )));
        }
        existing.push(checkpoint.clone());
        existing.sort_by_key(|c| c.stage_index);

        let stored = tables.owned_mut(job.id, owner)?;
        merge_job(stored, job);
        Ok(())
    }

    async fn latest_checkpoint(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError> {
        let tables = lock(&self.inner)?;
        Ok(tables
            .checkpoints
            .get(&job_id)
            .and_then(|c| c.iter().max_by_key(|c| c.stage_index))
            .cloned())
    }

    async fn checkpoints(&self, job_id: JobId) -> Result<Vec<Checkpoint>, StoreError> {
        let tables = lock(&self.inner)?;
        Ok(tables.checkpoints.get(&job_id).cloned().unwrap_or_default())
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        owner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.inner)?;
        let job = tables.owned_mut(job_id, owner)?;
        job.last_heartbeat_at = Some(now);
        Ok(())
    }

    async fn record_progress(
        &self,
        job_id: JobId,
        owner: RunnerId,
        percent: u8,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.inner)?;
        let job = tables.owned_mut(job_id, owner)?;
        if job.raise_progress(percent) {
            job.updated_at = now;
        }
        Ok(())
    }

    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut tables = lock(&self.inner)?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;

        if !job.status.is_terminal() {
            job.cancel_requested = true;
            job.updated_at = now;
            // Unowned jobs have no runner to observe the flag.
            if job.owner.is_none() {
                job.mark_cancelled();
            }
        }
        Ok(job.clone())
    }
}

type TaskKey = (JobId, String, String);

#[derive(Debug, Default)]
struct TaskTables {
    tasks: HashMap<TaskId, Task>,
    keys: HashMap<TaskKey, TaskId>,
    archive: HashMap<TaskId, Task>,
    /// Jobs whose tasks were cancelled; their retries are dead-lettered.
    cancelled_jobs: HashSet<JobId>,
}

impl TaskTables {
    fn leased_mut(
        &mut self,
        task_id: TaskId,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<&mut Task, StoreError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if !task.holds_lease(token, now) {
            return Err(StoreError::LeaseLost(task_id));
        }
        Ok(task)
    }

    fn job_tasks(&self, job_id: JobId) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(move |t| t.job_id == job_id)
    }
}

fn dead_letter(task: &mut Task, reason: DeadLetterReason, error: Option<&str>, now: DateTime<Utc>) {
    task.status = TaskStatus::DeadLetter;
    task.dead_letter_reason = Some(reason);
    if let Some(error) = error {
        task.last_error = Some(error.to_string());
    }
    task.lease_token = None;
    task.lease_owner = None;
    task.updated_at = now;
}

/// In-memory task queue table.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<TaskTables>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: Task) -> Result<Task, StoreError> {
        let mut tables = lock(&self.inner)?;
        let key = (task.job_id, task.task_type.clone(), task.item_id.clone());
        if let Some(existing) = tables.keys.get(&key) {
            let existing = tables
                .tasks
                .get(existing)
                .or_else(|| tables.archive.get(existing))
                .cloned()
                .ok_or_else(|| StoreError::storage("task key index out of sync"))?;
            return Ok(existing);
        }
        tables.keys.insert(key, task.id);
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let tables = lock(&self.inner)?;
        Ok(tables
            .tasks
            .get(&task_id)
            .or_else(|| tables.archive.get(&task_id))
            .cloned())
    }

    async fn claim(
        &self,
        task_type: &str,
        batch_size: usize,
        lease: Duration,
        owner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let mut tables = lock(&self.inner)?;

        let mut candidates: Vec<(DateTime<Utc>, DateTime<Utc>, TaskId)> = tables
            .tasks
            .values()
            .filter(|t| t.task_type == task_type && t.is_claimable(now))
            .map(|t| (t.visible_at, t.created_at, t.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let lease_until = now + chrono_duration(lease);
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(task) = tables.tasks.get_mut(&id) {
                task.status = TaskStatus::Processing;
                task.attempt_count += 1;
                task.visible_at = lease_until;
                task.lease_token = Some(LeaseToken::new());
                task.lease_owner = Some(owner);
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let mut tables = lock(&self.inner)?;
        let task = tables.leased_mut(task_id, token, now)?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.lease_token = None;
        task.lease_owner = None;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn fail(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        error: &str,
        disposition: FailDisposition,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let mut tables = lock(&self.inner)?;
        let job_cancelled = tables
            .tasks
            .get(&task_id)
            .is_some_and(|t| tables.cancelled_jobs.contains(&t.job_id));
        let task = tables.leased_mut(task_id, token, now)?;
        match disposition {
            FailDisposition::Retry { .. } if job_cancelled => {
                dead_letter(task, DeadLetterReason::Cancelled, Some(error), now)
            }
            FailDisposition::Retry { visible_at } => {
                task.status = TaskStatus::Pending;
                task.visible_at = visible_at;
                task.last_error = Some(error.to_string());
                task.lease_token = None;
                task.lease_owner = None;
                task.updated_at = now;
            }
            FailDisposition::DeadLetter(reason) => dead_letter(task, reason, Some(error), now),
        }
        Ok(task.clone())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let mut tables = lock(&self.inner)?;
        let mut reaped = Vec::new();
        for task in tables.tasks.values_mut().filter(|t| t.is_abandoned(now)) {
            dead_letter(task, DeadLetterReason::Exhausted, Some("lease expired"), now);
            reaped.push(task.clone());
        }
        Ok(reaped)
    }

    async fn fan_in_status(
        &self,
        job_id: JobId,
        task_type: &str,
    ) -> Result<FanInStatus, StoreError> {
        let tables = lock(&self.inner)?;
        let mut status = FanInStatus::default();
        let archived = tables
            .archive
            .values()
            .filter(|t| t.job_id == job_id && t.task_type == task_type);
        for task in tables
            .job_tasks(job_id)
            .filter(|t| t.task_type == task_type)
            .chain(archived)
        {
            status.total += 1;
            match task.status {
                TaskStatus::Completed => status.completed += 1,
                TaskStatus::DeadLetter => status.dead_lettered += 1,
                TaskStatus::Pending | TaskStatus::Processing => status.outstanding += 1,
            }
        }
        Ok(status)
    }

    async fn list(
        &self,
        job_id: JobId,
        task_type: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, StoreError> {
        let tables = lock(&self.inner)?;
        let mut result: Vec<Task> = tables
            .job_tasks(job_id)
            .filter(|t| task_type.is_none_or(|ty| t.task_type == ty))
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        result.sort_by_key(|t| (t.created_at, t.id));
        Ok(result)
    }

    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = lock(&self.inner)?;
        tables.cancelled_jobs.insert(job_id);
        let mut cancelled = 0;
        for task in tables
            .tasks
            .values_mut()
            .filter(|t| t.job_id == job_id && t.status == TaskStatus::Pending)
        {
            dead_letter(task, DeadLetterReason::Cancelled, Some("job cancelled"), now);
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn retry_dead_letter(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let mut tables = lock(&self.inner)?;
        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::DeadLetter {
            return Err(StoreError::Conflict(format!(
                "task {task_id} is {}, not dead_letter",
                task.status.as_str()
            )));
        }
        task.status = TaskStatus::Pending;
        task.attempt_count = 0;
        task.visible_at = now;
        task.dead_letter_reason = None;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn archive_completed(&self, job_id: JobId) -> Result<usize, StoreError> {
        let mut tables = lock(&self.inner)?;
        let ids: Vec<TaskId> = tables
            .job_tasks(job_id)
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();
        for id in &ids {
            if let Some(task) = tables.tasks.remove(id) {
                tables.archive.insert(*id, task);
            }
        }
        Ok(ids.len())
    }

    async fn stats(&self, job_id: JobId) -> Result<TaskStats, StoreError> {
        let tables = lock(&self.inner)?;
        let mut stats = TaskStats::default();
        for task in tables.job_tasks(job_id) {
            stats.record(task.status);
        }
        Ok(stats)
    }
}

/// In-memory content store.
///
/// Ids are derived from the write key, so repeated writes of the same item
/// replace the earlier record.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    items: Mutex<BTreeMap<String, ContentItem>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn put(
        &self,
        id: String,
        job_id: Option<JobId>,
        kind: ContentKind,
        body: serde_json::Value,
    ) -> Result<String, ContentError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| ContentError::Unavailable("content store lock poisoned".into()))?;
        items.insert(
            id.clone(),
            ContentItem {
                id: id.clone(),
                job_id,
                kind,
                body,
            },
        );
        Ok(id)
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ContentError> {
    serde_json::to_value(value).map_err(|e| ContentError::Rejected(e.to_string()))
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn put_chunk(&self, job_id: JobId, chunk: ChunkRecord) -> Result<String, ContentError> {
        let id = format!("{job_id}:chunk:{}", chunk.key);
        self.put(id, Some(job_id), ContentKind::Chunk, to_body(&chunk)?)
    }

    async fn put_image(&self, job_id: JobId, image: ImageRecord) -> Result<String, ContentError> {
        let id = format!("{job_id}:image:{}", image.key);
        self.put(id, Some(job_id), ContentKind::Image, to_body(&image)?)
    }

    async fn put_embedding(
        &self,
        owner_id: &str,
        vector: Vec<f32>,
        kind: EmbeddingKind,
    ) -> Result<String, ContentError> {
        if vector.is_empty() {
            return Err(ContentError::Rejected("empty embedding vector".into()));
        }
        let suffix = match kind {
            EmbeddingKind::Text => "text",
            EmbeddingKind::Image => "image",
        };
        let id = format!("{owner_id}:embedding:{suffix}");
        let body = serde_json::json!({
            "owner_id": owner_id,
            "kind": kind,
            "dimensions": vector.len(),
            "vector": vector,
        });
        self.put(id, None, ContentKind::Embedding, body)
    }

    async fn put_product(
        &self,
        job_id: JobId,
        product: ProductRecord,
    ) -> Result<String, ContentError> {
        if product.name.trim().is_empty() {
            return Err(ContentError::Rejected("product name is empty".into()));
        }
        let id = format!("{job_id}:product:{}", product.key);
        self.put(id, Some(job_id), ContentKind::Product, to_body(&product)?)
    }

    async fn put_relationship(
        &self,
        job_id: JobId,
        relationship: RelationshipRecord,
    ) -> Result<String, ContentError> {
        let id = format!(
            "{job_id}:rel:{}:{}:{}",
            relationship.kind, relationship.source_id, relationship.target_id
        );
        self.put(id, Some(job_id), ContentKind::Relationship, to_body(&relationship)?)
    }

    async fn query(&self, filter: ContentFilter) -> Result<Vec<ContentItem>, ContentError> {
        let items = self
            .items
            .lock()
            .map_err(|_| ContentError::Unavailable("content store lock poisoned".into()))?;
        Ok(items.values().filter(|i| filter.matches(i)).cloned().collect())
    }
}
