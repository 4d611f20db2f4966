//! Environment loading and connection wiring for the Postgres stores.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use ingest_pipeline::{JobStore, TaskStore};

use crate::postgres::{PostgresJobStore, PostgresTaskStore};
use crate::schema;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Database settings read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl InfraConfig {
    /// Load `.env` (if present), then read `DATABASE_URL` and the optional
    /// `INGEST_DB_MAX_CONNECTIONS`.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;
        let max_connections = match lookup("INGEST_DB_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .with_context(|| format!("INGEST_DB_MAX_CONNECTIONS must be a positive integer, got {raw:?}"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        Ok(Self {
            database_url,
            max_connections,
        })
    }

    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .context("failed to connect to Postgres")
    }
}

/// Durable stores sharing one connection pool.
#[derive(Clone)]
pub struct PostgresStores {
    pub jobs: Arc<PostgresJobStore>,
    pub tasks: Arc<PostgresTaskStore>,
}

impl PostgresStores {
    /// Connect, create missing tables, and build both stores.
    pub async fn open(config: &InfraConfig) -> anyhow::Result<Self> {
        let pool = config.connect().await?;
        schema::migrate(&pool).await?;
        info!(max_connections = config.max_connections, "postgres stores ready");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            tasks: Arc::new(PostgresTaskStore::new(pool)),
        }
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.jobs.clone()
    }

    pub fn task_store(&self) -> Arc<dyn TaskStore> {
        self.tasks.clone()
    }
}
