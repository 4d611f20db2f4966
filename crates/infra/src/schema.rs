//! Table definitions for the Postgres stores.
//!
//! Every statement is idempotent, so [`migrate`] can run on each process start.

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "ingest_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS ingest_jobs (
            id                 UUID PRIMARY KEY,
            input              JSONB NOT NULL,
            status             TEXT NOT NULL,
            current_stage      TEXT NULL,
            progress_percent   SMALLINT NOT NULL DEFAULT 0
                               CHECK (progress_percent BETWEEN 0 AND 100),
            created_at         TIMESTAMPTZ NOT NULL,
            updated_at         TIMESTAMPTZ NOT NULL,
            last_heartbeat_at  TIMESTAMPTZ NULL,
            restart_count      BIGINT NOT NULL DEFAULT 0,
            stage_attempts     BIGINT NOT NULL DEFAULT 0,
            retry_at           TIMESTAMPTZ NULL,
            error              TEXT NULL,
            cancel_requested   BOOLEAN NOT NULL DEFAULT FALSE,
            owner              UUID NULL,
            report             JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#,
    ),
    (
        "ingest_jobs_status_idx",
        "CREATE INDEX IF NOT EXISTS ingest_jobs_status_idx ON ingest_jobs (status, created_at)",
    ),
    (
        "ingest_checkpoints",
        r#"
        CREATE TABLE IF NOT EXISTS ingest_checkpoints (
            job_id        UUID NOT NULL REFERENCES ingest_jobs (id) ON DELETE CASCADE,
            stage_index   BIGINT NOT NULL CHECK (stage_index >= 0),
            stage_name    TEXT NOT NULL,
            state_blob    JSONB NOT NULL,
            completed_at  TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (job_id, stage_index)
        )
        "#,
    ),
    (
        "ingest_tasks",
        r#"
        CREATE TABLE IF NOT EXISTS ingest_tasks (
            id                  UUID PRIMARY KEY,
            job_id              UUID NOT NULL,
            task_type           TEXT NOT NULL,
            item_id             TEXT NOT NULL,
            payload             JSONB NOT NULL,
            status              TEXT NOT NULL,
            attempt_count       BIGINT NOT NULL DEFAULT 0,
            max_attempts        BIGINT NOT NULL CHECK (max_attempts >= 1),
            visible_at          TIMESTAMPTZ NOT NULL,
            last_error          TEXT NULL,
            result              JSONB NULL,
            lease_token         UUID NULL,
            lease_owner         UUID NULL,
            dead_letter_reason  TEXT NULL,
            created_at          TIMESTAMPTZ NOT NULL,
            updated_at          TIMESTAMPTZ NOT NULL,
            UNIQUE (job_id, task_type, item_id)
        )
        "#,
    ),
    (
        "ingest_tasks_claim_idx",
        r#"
        CREATE INDEX IF NOT EXISTS ingest_tasks_claim_idx
            ON ingest_tasks (task_type, visible_at, created_at)
            WHERE status IN ('pending', 'processing')
        "#,
    ),
    (
        "ingest_tasks_job_idx",
        "CREATE INDEX IF NOT EXISTS ingest_tasks_job_idx ON ingest_tasks (job_id, task_type)",
    ),
    (
        "ingest_cancelled_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS ingest_cancelled_jobs (
            job_id        UUID PRIMARY KEY,
            cancelled_at  TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "ingest_tasks_archive",
        "CREATE TABLE IF NOT EXISTS ingest_tasks_archive (LIKE ingest_tasks INCLUDING ALL)",
    ),
];

/// Create the pipeline tables and indexes if they do not exist yet.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    for (name, statement) in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("failed to create {name}"))?;
    }
    info!(statements = STATEMENTS.len(), "pipeline schema ready");
    Ok(())
}
