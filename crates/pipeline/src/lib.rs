//! `ingest-pipeline`: orchestration, checkpointing and the retryable task queue
//! behind document ingestion.
//!
//! ## Components
//!
//! - [`PipelineOrchestrator`]: sequences stages per job, persists checkpoints, resumes
//! - [`CheckpointStore`]: durable stage completion + heartbeats
//! - [`TaskQueue`]: lease-based fan-out queue with backoff and dead-lettering
//! - [`WorkerPool`]: bounded workers per task type
//! - [`JobMonitor`]: stuck-job detection and bounded auto-recovery
//!
//! Persistence goes through the [`JobStore`] and [`TaskStore`] traits. In-memory
//! implementations live in [`memory`]; durable ones live in `ingest-infra`.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod content;
pub mod job;
pub mod memory;
pub mod monitor;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod stage;
pub mod store;
pub mod task;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{ConfigError, PipelineConfig};
pub use content::{ContentError, ContentFilter, ContentKind, ContentStore};
pub use job::{Job, JobInput, JobReport, JobStatus, JobStatusView, StageReport};
pub use memory::{InMemoryContentStore, InMemoryJobStore, InMemoryTaskStore};
pub use monitor::{JobMonitor, MonitorConfig, MonitorHandle, ScanReport};
pub use orchestrator::{
    Advance, DriveHandle, OrchestratorConfig, OrchestratorError, PipelineOrchestrator,
};
pub use provider::{AiProvider, AnalyzeRequest, ProviderError};
pub use queue::{FanInOutcome, TaskQueue};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::{PipelineRuntime, RuntimeHandle};
pub use stage::{
    FanInPolling, PipelineDefinition, ProgressBand, StageContext, StageError, StageExecutor,
    StageResult, StageSpec,
};
pub use store::{FailDisposition, JobFilter, JobStore, StoreError, TaskStore};
pub use task::{DeadLetterReason, FanInStatus, Task, TaskFailure, TaskStats, TaskStatus};
pub use worker::{TaskHandler, WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats};
