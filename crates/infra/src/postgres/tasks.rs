//! Postgres task queue table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use ingest_core::{JobId, LeaseToken, RunnerId, TaskId};
use ingest_pipeline::job::chrono_duration;
use ingest_pipeline::{
    DeadLetterReason, FailDisposition, FanInStatus, StoreError, Task, TaskStats, TaskStatus,
    TaskStore,
};

use super::rows::{task_from_row, tasks_from_rows};
use super::{map_sqlx_error, to_i64};

/// Postgres-backed task queue.
///
/// Claims select with `FOR UPDATE SKIP LOCKED` and flip the rows to
/// `processing` in the same statement, so concurrent workers never receive the
/// same task. Each claimed row gets a fresh lease token from
/// `gen_random_uuid()`; `complete` and `fail` only match while that token is
/// current and the lease has not expired.
///
/// Completed tasks of finished jobs move to `ingest_tasks_archive`, which still
/// counts for fan-in totals and enqueue dedupe.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Explain why a lease-fenced write matched nothing.
    async fn lease_error(&self, task_id: TaskId) -> StoreError {
        match sqlx::query("SELECT 1 FROM ingest_tasks WHERE id = $1")
            .bind(task_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
        {
            Ok(Some(_)) => StoreError::LeaseLost(task_id),
            Ok(None) => StoreError::TaskNotFound(task_id),
            Err(e) => map_sqlx_error("check_lease", e),
        }
    }

    async fn find_by_key(
        &self,
        table: &str,
        job_id: JobId,
        task_type: &str,
        item_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            "SELECT * FROM {table} WHERE job_id = $1 AND task_type = $2 AND item_id = $3"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(task_type)
            .bind(item_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(
        skip(self, task),
        fields(job_id = %task.job_id, task_type = %task.task_type, item_id = %task.item_id),
        err
    )]
    async fn enqueue(&self, task: Task) -> Result<Task, StoreError> {
        if let Some(archived) = self
            .find_by_key("ingest_tasks_archive", task.job_id, &task.task_type, &task.item_id)
            .await?
        {
            return Ok(archived);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO ingest_tasks (
                id, job_id, task_type, item_id, payload, status, attempt_count,
                max_attempts, visible_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (job_id, task_type, item_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.job_id.as_uuid())
        .bind(&task.task_type)
        .bind(&task.item_id)
        .bind(&task.payload)
        .bind(task.status.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(i64::from(task.max_attempts))
        .bind(task.visible_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue_task", e))?;

        match row {
            Some(row) => task_from_row(&row),
            None => self
                .find_by_key("ingest_tasks", task.job_id, &task.task_type, &task.item_id)
                .await?
                .ok_or_else(|| StoreError::storage("task vanished after enqueue conflict")),
        }
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM ingest_tasks WHERE id = $1
            UNION ALL
            SELECT * FROM ingest_tasks_archive WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(task_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn claim(
        &self,
        task_type: &str,
        batch_size: usize,
        lease: Duration,
        owner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let lease_until = now + chrono_duration(lease);
        let rows = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id FROM ingest_tasks
                WHERE task_type = $1
                  AND visible_at <= $2
                  AND (
                      status = 'pending'
                      OR (status = 'processing' AND attempt_count < max_attempts)
                  )
                ORDER BY visible_at, created_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ingest_tasks t SET
                status = 'processing',
                attempt_count = t.attempt_count + 1,
                visible_at = $4,
                lease_token = gen_random_uuid(),
                lease_owner = $5,
                updated_at = $2
            FROM picked
            WHERE t.id = picked.id
            RETURNING t.*
            "#,
        )
        .bind(task_type)
        .bind(now)
        .bind(to_i64("batch_size", batch_size)?)
        .bind(lease_until)
        .bind(owner.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_tasks", e))?;

        let mut tasks = tasks_from_rows(&rows)?;
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    #[instrument(skip(self, token, result), fields(task_id = %task_id), err)]
    async fn complete(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE ingest_tasks SET
                status = 'completed',
                result = $3,
                lease_token = NULL,
                lease_owner = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND lease_token = $2 AND visible_at > $4
            RETURNING *
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(token.as_uuid())
        .bind(&result)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_task", e))?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(self.lease_error(task_id).await),
        }
    }

    #[instrument(skip(self, token), fields(task_id = %task_id), err)]
    async fn fail(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        error: &str,
        disposition: FailDisposition,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let query = match disposition {
            // A job cancelled while this task ran gets no retry.
            FailDisposition::Retry { visible_at } => sqlx::query(
                r#"
                UPDATE ingest_tasks SET
                    status = CASE WHEN j.cancelled THEN 'dead_letter' ELSE 'pending' END,
                    dead_letter_reason = CASE WHEN j.cancelled THEN $6 END,
                    visible_at = CASE WHEN j.cancelled THEN ingest_tasks.visible_at ELSE $5 END,
                    last_error = $3,
                    lease_token = NULL,
                    lease_owner = NULL,
                    updated_at = $4
                FROM (
                    SELECT EXISTS (
                        SELECT 1 FROM ingest_cancelled_jobs c
                        JOIN ingest_tasks t ON t.job_id = c.job_id
                        WHERE t.id = $1
                    ) AS cancelled
                ) AS j
                WHERE id = $1 AND status = 'processing' AND lease_token = $2 AND visible_at > $4
                RETURNING ingest_tasks.*
                "#,
            )
            .bind(task_id.as_uuid())
            .bind(token.as_uuid())
            .bind(error)
            .bind(now)
            .bind(visible_at)
            .bind(DeadLetterReason::Cancelled.as_str()),
            FailDisposition::DeadLetter(reason) => sqlx::query(
                r#"
                UPDATE ingest_tasks SET
                    status = 'dead_letter',
                    dead_letter_reason = $5,
                    last_error = $3,
                    lease_token = NULL,
                    lease_owner = NULL,
                    updated_at = $4
                WHERE id = $1 AND status = 'processing' AND lease_token = $2 AND visible_at > $4
                RETURNING *
                "#,
            )
            .bind(task_id.as_uuid())
            .bind(token.as_uuid())
            .bind(error)
            .bind(now)
            .bind(reason.as_str()),
        };

        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fail_task", e))?;
        match row {
            Some(row) => task_from_row(&row),
            None => Err(self.lease_error(task_id).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE ingest_tasks SET
                status = 'dead_letter',
                dead_letter_reason = $2,
                last_error = 'lease expired',
                lease_token = NULL,
                lease_owner = NULL,
                updated_at = $1
            WHERE status = 'processing'
              AND visible_at <= $1
              AND attempt_count >= max_attempts
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(DeadLetterReason::Exhausted.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired", e))?;
        tasks_from_rows(&rows)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn fan_in_status(
        &self,
        job_id: JobId,
        task_type: &str,
    ) -> Result<FanInStatus, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n FROM (
                SELECT status FROM ingest_tasks WHERE job_id = $1 AND task_type = $2
                UNION ALL
                SELECT status FROM ingest_tasks_archive WHERE job_id = $1 AND task_type = $2
            ) AS all_tasks
            GROUP BY status
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(task_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fan_in_status", e))?;

        let mut status = FanInStatus::default();
        for (task_status, count) in status_counts(&rows)? {
            status.total += count;
            match task_status {
                TaskStatus::Completed => status.completed += count,
                TaskStatus::DeadLetter => status.dead_lettered += count,
                TaskStatus::Pending | TaskStatus::Processing => status.outstanding += count,
            }
        }
        Ok(status)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list(
        &self,
        job_id: JobId,
        task_type: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ingest_tasks
            WHERE job_id = $1
              AND ($2::TEXT IS NULL OR task_type = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(task_type)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;
        tasks_from_rows(&rows)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<usize, StoreError> {
        // The marker lands first so a concurrent retryable `fail` sees it.
        sqlx::query(
            r#"
            INSERT INTO ingest_cancelled_jobs (job_id, cancelled_at)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_job_cancelled", e))?;

        let result = sqlx::query(
            r#"
            UPDATE ingest_tasks SET
                status = 'dead_letter',
                dead_letter_reason = $3,
                last_error = 'job cancelled',
                lease_token = NULL,
                lease_owner = NULL,
                updated_at = $2
            WHERE job_id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .bind(DeadLetterReason::Cancelled.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_job_tasks", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn retry_dead_letter(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE ingest_tasks SET
                status = 'pending',
                attempt_count = 0,
                visible_at = $2,
                dead_letter_reason = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'dead_letter'
            RETURNING *
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;

        if let Some(row) = row {
            return task_from_row(&row);
        }
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM ingest_tasks WHERE id = $1")
                .bind(task_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;
        match current {
            Some(status) => Err(StoreError::Conflict(format!(
                "task {task_id} is {status}, not dead_letter"
            ))),
            None => Err(StoreError::TaskNotFound(task_id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn archive_completed(&self, job_id: JobId) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM ingest_tasks
                WHERE job_id = $1 AND status = 'completed'
                RETURNING *
            )
            INSERT INTO ingest_tasks_archive SELECT * FROM moved
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("archive_completed", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn stats(&self, job_id: JobId) -> Result<TaskStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM ingest_tasks WHERE job_id = $1 GROUP BY status",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("task_stats", e))?;

        let mut stats = TaskStats::default();
        for (status, count) in status_counts(&rows)? {
            match status {
                TaskStatus::Pending => stats.pending += count,
                TaskStatus::Processing => stats.processing += count,
                TaskStatus::Completed => stats.completed += count,
                TaskStatus::DeadLetter => stats.dead_lettered += count,
            }
        }
        Ok(stats)
    }
}

fn status_counts(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<(TaskStatus, usize)>, StoreError> {
    rows.iter()
        .map(|row| {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("decode_status", e))?;
            let count: i64 = row
                .try_get("n")
                .map_err(|e| map_sqlx_error("decode_count", e))?;
            let status = status
                .parse()
                .map_err(|e| StoreError::storage(format!("unknown task status: {e}")))?;
            Ok((status, usize::try_from(count).unwrap_or_default()))
        })
        .collect()
}
