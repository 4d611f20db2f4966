//! Row decoding for the pipeline tables.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use ingest_core::{JobId, LeaseToken, RunnerId, TaskId};
use ingest_pipeline::{Checkpoint, Job, JobInput, JobReport, StoreError, Task};

use super::decode_error;

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).map_err(|e| decode_error(name, e))
}

fn counter(row: &PgRow, name: &str) -> Result<u32, StoreError> {
    let value: i64 = column(row, name)?;
    u32::try_from(value).map_err(|e| decode_error(name, e))
}

fn parsed<T>(row: &PgRow, name: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    let raw: String = column(row, name)?;
    raw.parse().map_err(|e| decode_error(name, e))
}

pub(crate) fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let progress: i16 = column(row, "progress_percent")?;
    let input: Json<JobInput> = column(row, "input")?;
    let report: Json<JobReport> = column(row, "report")?;
    let owner: Option<Uuid> = column(row, "owner")?;

    Ok(Job {
        id: JobId::from_uuid(column(row, "id")?),
        input: input.0,
        status: parsed(row, "status")?,
        current_stage: column(row, "current_stage")?,
        progress_percent: u8::try_from(progress).map_err(|e| decode_error("progress_percent", e))?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        last_heartbeat_at: column(row, "last_heartbeat_at")?,
        restart_count: counter(row, "restart_count")?,
        stage_attempts: counter(row, "stage_attempts")?,
        retry_at: column(row, "retry_at")?,
        error: column(row, "error")?,
        cancel_requested: column(row, "cancel_requested")?,
        owner: owner.map(RunnerId::from_uuid),
        report: report.0,
    })
}

pub(crate) fn checkpoint_from_row(row: &PgRow) -> Result<Checkpoint, StoreError> {
    let stage_index: i64 = column(row, "stage_index")?;
    let completed_at: DateTime<Utc> = column(row, "completed_at")?;

    Ok(Checkpoint {
        job_id: JobId::from_uuid(column(row, "job_id")?),
        stage_name: column(row, "stage_name")?,
        stage_index: usize::try_from(stage_index).map_err(|e| decode_error("stage_index", e))?,
        state_blob: column(row, "state_blob")?,
        completed_at,
    })
}

pub(crate) fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let lease_token: Option<Uuid> = column(row, "lease_token")?;
    let lease_owner: Option<Uuid> = column(row, "lease_owner")?;
    let reason: Option<String> = column(row, "dead_letter_reason")?;

    Ok(Task {
        id: TaskId::from_uuid(column(row, "id")?),
        job_id: JobId::from_uuid(column(row, "job_id")?),
        task_type: column(row, "task_type")?,
        item_id: column(row, "item_id")?,
        payload: column(row, "payload")?,
        status: parsed(row, "status")?,
        attempt_count: counter(row, "attempt_count")?,
        max_attempts: counter(row, "max_attempts")?,
        visible_at: column(row, "visible_at")?,
        last_error: column(row, "last_error")?,
        result: column(row, "result")?,
        lease_token: lease_token.map(LeaseToken::from_uuid),
        lease_owner: lease_owner.map(RunnerId::from_uuid),
        dead_letter_reason: reason
            .map(|r| r.parse())
            .transpose()
            .map_err(|e| decode_error("dead_letter_reason", e))?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

pub(crate) fn jobs_from_rows(rows: &[PgRow]) -> Result<Vec<Job>, StoreError> {
    rows.iter().map(job_from_row).collect()
}

pub(crate) fn tasks_from_rows(rows: &[PgRow]) -> Result<Vec<Task>, StoreError> {
    rows.iter().map(task_from_row).collect()
}
