//! Postgres job + checkpoint store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::instrument;
use uuid::Uuid;

use ingest_core::{JobId, RunnerId};
use ingest_pipeline::{Checkpoint, Job, JobFilter, JobStore, StoreError};

use super::rows::{checkpoint_from_row, job_from_row, jobs_from_rows};
use super::{map_sqlx_error, to_i64};

const TERMINAL: &str = "('failed', 'completed', 'cancelled')";

/// Postgres-backed job and checkpoint store.
///
/// Ownership fencing is pushed into SQL: every write after `acquire` carries
/// `AND owner = $owner`, so a runner that lost the job to a takeover matches no
/// row and gets `OwnershipLost`. Progress uses `GREATEST` and the cancel flag
/// uses `OR`, which keeps both monotonic no matter which runner writes last.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

/// Fenced full-row write shared by `update` and `save_checkpoint`.
async fn write_owned(
    conn: &mut PgConnection,
    job: &Job,
    owner: RunnerId,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE ingest_jobs SET
            input = $2,
            status = $3,
            current_stage = $4,
            progress_percent = GREATEST(progress_percent, $5),
            updated_at = $6,
            last_heartbeat_at = $7,
            restart_count = $8,
            stage_attempts = $9,
            retry_at = $10,
            error = $11,
            cancel_requested = cancel_requested OR $12,
            owner = $13,
            report = $14
        WHERE id = $1 AND owner = $15
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(Json(&job.input))
    .bind(job.status.as_str())
    .bind(job.current_stage.as_deref())
    .bind(i16::from(job.progress_percent.min(100)))
    .bind(job.updated_at)
    .bind(job.last_heartbeat_at)
    .bind(i64::from(job.restart_count))
    .bind(i64::from(job.stage_attempts))
    .bind(job.retry_at)
    .bind(job.error.as_deref())
    .bind(job.cancel_requested)
    .bind(job.owner.map(Uuid::from))
    .bind(Json(&job.report))
    .bind(owner.as_uuid())
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;
    Ok(result.rows_affected())
}

/// Explain why a fenced write matched nothing.
async fn fence_error(pool: &PgPool, job_id: JobId) -> StoreError {
    match sqlx::query("SELECT 1 FROM ingest_jobs WHERE id = $1")
        .bind(job_id.as_uuid())
        .fetch_optional(pool)
        .await
    {
        Ok(Some(_)) => StoreError::OwnershipLost(job_id),
        Ok(None) => StoreError::JobNotFound(job_id),
        Err(e) => map_sqlx_error("check_owner", e),
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (
                id, input, status, current_stage, progress_percent,
                created_at, updated_at, last_heartbeat_at, restart_count,
                stage_attempts, retry_at, error, cancel_requested, owner, report
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(Json(&job.input))
        .bind(job.status.as_str())
        .bind(job.current_stage.as_deref())
        .bind(i16::from(job.progress_percent.min(100)))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.last_heartbeat_at)
        .bind(i64::from(job.restart_count))
        .bind(i64::from(job.stage_attempts))
        .bind(job.retry_at)
        .bind(job.error.as_deref())
        .bind(job.cancel_requested)
        .bind(job.owner.map(Uuid::from))
        .bind(Json(&job.report))
        .execute(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("insert_job", e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!("job already exists: {}", job.id)),
            other => other,
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM ingest_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut query: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT * FROM ingest_jobs WHERE TRUE");
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            query.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(before) = filter.seen_before {
            query
                .push(" AND COALESCE(last_heartbeat_at, updated_at) < ")
                .push_bind(before);
        }
        if let Some(due) = filter.retry_due_by {
            query.push(" AND retry_at <= ").push_bind(due);
        }
        query.push(" ORDER BY created_at ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(to_i64("limit", limit)?);
        }

        let rows = query
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
        jobs_from_rows(&rows)
    }

    #[instrument(skip(self), fields(job_id = %job_id, owner = %owner), err)]
    async fn acquire(
        &self,
        job_id: JobId,
        owner: RunnerId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            UPDATE ingest_jobs
            SET owner = $2, last_heartbeat_at = $3, updated_at = $3
            WHERE id = $1
              AND status NOT IN {TERMINAL}
              AND (
                  owner IS NULL
                  OR owner = $2
                  OR COALESCE(last_heartbeat_at, updated_at) < $4
              )
            RETURNING *
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(owner.as_uuid())
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("acquire_job", e))?;

        match row {
            Some(row) => job_from_row(&row).map(Some),
            None => match self.get(job_id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::JobNotFound(job_id)),
            },
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn update(&self, job: &Job, owner: RunnerId) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        let written = write_owned(&mut *conn, job, owner).await?;
        drop(conn);
        if written == 0 {
            return Err(fence_error(&*self.pool, job.id).await);
        }
        Ok(())
    }

    #[instrument(
        skip(self, job, checkpoint),
        fields(job_id = %job.id, stage = %checkpoint.stage_name, stage_index = checkpoint.stage_index),
        err
    )]
    async fn save_checkpoint(
        &self,
        job: &Job,
        checkpoint: &Checkpoint,
        owner: RunnerId,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Lock the job row first so a concurrent takeover waits for this commit.
        let stored_owner: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT owner FROM ingest_jobs WHERE id = $1 FOR UPDATE")
                .bind(job.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lock_job", e))?;
        match stored_owner {
            None => return Err(StoreError::JobNotFound(job.id)),
            Some(current) if current != Some(Uuid::from(owner)) => {
                return Err(StoreError::OwnershipLost(job.id));
            }
            Some(_) => {}
        }

        sqlx::query(
            r#"
            INSERT INTO ingest_checkpoints (job_id, stage_index, stage_name, state_blob, completed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(checkpoint.job_id.as_uuid())
        .bind(to_i64("stage_index", checkpoint.stage_index)?)
        .bind(&checkpoint.stage_name)
        .bind(&checkpoint.state_blob)
        .bind(checkpoint.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx_error("insert_checkpoint", e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!(
                "checkpoint for stage {} of job {} already exists",
                checkpoint.stage_index, job.id
            )),
            other => other,
        })?;

        if write_owned(&mut *tx, job, owner).await? == 0 {
            return Err(StoreError::OwnershipLost(job.id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn latest_checkpoint(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM ingest_checkpoints
            WHERE job_id = $1
            ORDER BY stage_index DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_checkpoint", e))?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn checkpoints(&self, job_id: JobId) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM ingest_checkpoints WHERE job_id = $1 ORDER BY stage_index ASC",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_checkpoints", e))?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn heartbeat(
        &self,
        job_id: JobId,
        owner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE ingest_jobs SET last_heartbeat_at = $3 WHERE id = $1 AND owner = $2")
                .bind(job_id.as_uuid())
                .bind(owner.as_uuid())
                .bind(now)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("heartbeat", e))?;
        if result.rows_affected() == 0 {
            return Err(fence_error(&*self.pool, job_id).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn record_progress(
        &self,
        job_id: JobId,
        owner: RunnerId,
        percent: u8,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs SET
                updated_at = CASE WHEN progress_percent < $3 THEN $4 ELSE updated_at END,
                progress_percent = GREATEST(progress_percent, $3)
            WHERE id = $1 AND owner = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(owner.as_uuid())
        .bind(i16::from(percent.min(100)))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_progress", e))?;
        if result.rows_affected() == 0 {
            return Err(fence_error(&*self.pool, job_id).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        // Unowned jobs have no runner to observe the flag, so they are cancelled here.
        let sql = format!(
            r#"
            UPDATE ingest_jobs SET
                cancel_requested = TRUE,
                updated_at = $2,
                status = CASE WHEN owner IS NULL THEN 'cancelled' ELSE status END,
                retry_at = CASE WHEN owner IS NULL THEN NULL ELSE retry_at END
            WHERE id = $1 AND status NOT IN {TERMINAL}
            RETURNING *
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("request_cancel", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => self
                .get(job_id)
                .await?
                .ok_or(StoreError::JobNotFound(job_id)),
        }
    }
}
