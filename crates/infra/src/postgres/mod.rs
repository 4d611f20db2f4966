//! Postgres-backed job and task stores.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate job id or checkpoint for a stage |
//! | Database (foreign key violation) | `23503` | `Storage` | Checkpoint for a job that does not exist |
//! | Database (other) | Any other | `Storage` | Constraint or syntax errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! Fencing failures (`OwnershipLost`, `LeaseLost`) never come from SQLx: a fenced
//! `UPDATE` that matches no row is diagnosed with a follow-up existence check.

mod jobs;
mod rows;
mod tasks;

pub use jobs::PostgresJobStore;
pub use tasks::PostgresTaskStore;

use ingest_pipeline::StoreError;

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// A stored value that no longer fits the domain type.
pub(crate) fn decode_error(column: &str, err: impl core::fmt::Display) -> StoreError {
    StoreError::storage(format!("failed to decode column {column}: {err}"))
}

pub(crate) fn to_i64(column: &str, value: impl TryInto<i64>) -> Result<i64, StoreError> {
    value
        .try_into()
        .map_err(|_| StoreError::storage(format!("{column} out of range")))
}
