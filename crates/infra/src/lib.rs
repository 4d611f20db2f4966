//! Infrastructure layer: Postgres persistence and environment loading for the
//! ingestion pipeline.

pub mod config;
pub mod postgres;
pub mod schema;

pub use config::{InfraConfig, PostgresStores};
pub use postgres::{PostgresJobStore, PostgresTaskStore};
