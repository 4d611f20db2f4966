//! Durable stage completion records and heartbeats.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingest_core::{JobId, RunnerId};

use crate::job::Job;
use crate::store::{JobStore, StoreError};

/// Marks one stage complete for a job; the basis for resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    pub stage_name: String,
    pub stage_index: usize,
    /// Stage output, handed to the next stage as its input.
    pub state_blob: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        job_id: JobId,
        stage_name: impl Into<String>,
        stage_index: usize,
        state_blob: serde_json::Value,
    ) -> Self {
        Self {
            job_id,
            stage_name: stage_name.into(),
            stage_index,
            state_blob,
            completed_at: Utc::now(),
        }
    }
}

/// Checkpoint and heartbeat operations over a [`JobStore`].
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn JobStore>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Persist `checkpoint` together with the job row carrying its new progress.
    ///
    /// Both land in one store transaction, so after a crash either both the
    /// checkpoint and the raised progress are visible or neither is.
    pub async fn save(
        &self,
        job: &Job,
        owner: RunnerId,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        if checkpoint.job_id != job.id {
            return Err(StoreError::Conflict(format!(
                "checkpoint for job {} saved against job {}",
                checkpoint.job_id, job.id
            )));
        }
        self.store.save_checkpoint(job, checkpoint, owner).await?;
        tracing::debug!(
            job_id = %job.id,
            stage = %checkpoint.stage_name,
            stage_index = checkpoint.stage_index,
            progress = job.progress_percent,
            "checkpoint saved"
        );
        Ok(())
    }

    pub async fn latest(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError> {
        self.store.latest_checkpoint(job_id).await
    }

    pub async fn all(&self, job_id: JobId) -> Result<Vec<Checkpoint>, StoreError> {
        self.store.checkpoints(job_id).await
    }

    /// Refresh the job's heartbeat independently of checkpoint writes.
    pub async fn heartbeat(&self, job_id: JobId, owner: RunnerId) -> Result<(), StoreError> {
        self.store.heartbeat(job_id, owner, Utc::now()).await
    }
}
