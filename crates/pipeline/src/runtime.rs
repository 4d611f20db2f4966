//! Process wiring: orchestrator, worker pool and monitor started together.

use std::sync::Arc;

use tracing::info;

use crate::catalog::{
    CHUNK_EMBEDDING_TASK, ChunkEmbeddingHandler, IMAGE_EMBEDDING_TASK, ImageEmbeddingHandler,
    PRODUCT_ENRICHMENT_TASK, ProductEnrichmentHandler, catalog_pipeline,
};
use crate::config::PipelineConfig;
use crate::content::ContentStore;
use crate::monitor::{JobMonitor, MonitorHandle};
use crate::orchestrator::{OrchestratorError, PipelineOrchestrator};
use crate::provider::AiProvider;
use crate::queue::TaskQueue;
use crate::store::{JobStore, TaskStore};
use crate::worker::{WorkerPool, WorkerPoolHandle, WorkerStats};

/// Everything a pipeline process runs, not yet started.
pub struct PipelineRuntime {
    orchestrator: PipelineOrchestrator,
    workers: WorkerPool,
    monitor: JobMonitor,
}

impl PipelineRuntime {
    pub fn new(orchestrator: PipelineOrchestrator, workers: WorkerPool, monitor: JobMonitor) -> Self {
        Self {
            orchestrator,
            workers,
            monitor,
        }
    }

    /// Wire the catalog pipeline over the given stores and provider.
    pub fn catalog(
        config: &PipelineConfig,
        jobs: Arc<dyn JobStore>,
        tasks: Arc<dyn TaskStore>,
        provider: Arc<dyn AiProvider>,
        content: Arc<dyn ContentStore>,
    ) -> Result<Self, OrchestratorError> {
        config
            .validate()
            .map_err(|e| ingest_core::DomainError::validation(e.to_string()))?;

        let queue = TaskQueue::new(tasks, config.task_retry.clone());
        let pipeline = catalog_pipeline(provider.clone(), content.clone(), config)?;
        let orchestrator =
            PipelineOrchestrator::new(jobs.clone(), queue.clone(), pipeline, config.orchestrator());
        let workers = WorkerPool::new(queue)
            .register(
                CHUNK_EMBEDDING_TASK,
                Arc::new(ChunkEmbeddingHandler::new(provider.clone(), content.clone())),
                config.worker(CHUNK_EMBEDDING_TASK),
            )
            .register(
                IMAGE_EMBEDDING_TASK,
                Arc::new(ImageEmbeddingHandler::new(provider.clone(), content.clone())),
                config.worker(IMAGE_EMBEDDING_TASK),
            )
            .register(
                PRODUCT_ENRICHMENT_TASK,
                Arc::new(ProductEnrichmentHandler::new(provider, content)),
                config.worker(PRODUCT_ENRICHMENT_TASK),
            );
        let monitor = JobMonitor::new(orchestrator.clone(), jobs, config.monitor());

        Ok(Self::new(orchestrator, workers, monitor))
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    /// Start workers, resume unfinished jobs, then start the monitor.
    pub async fn start(self) -> Result<RuntimeHandle, OrchestratorError> {
        let workers = self.workers.spawn();
        let resumed = self.orchestrator.resume_all().await?;
        let monitor = self.monitor.spawn();
        info!(
            runner = %self.orchestrator.runner_id(),
            resumed = resumed.len(),
            "pipeline runtime started"
        );

        Ok(RuntimeHandle {
            orchestrator: self.orchestrator,
            workers,
            monitor,
        })
    }
}

/// Handle to a started runtime.
pub struct RuntimeHandle {
    orchestrator: PipelineOrchestrator,
    workers: WorkerPoolHandle,
    monitor: MonitorHandle,
}

impl RuntimeHandle {
    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.workers.stats()
    }

    /// Stop the monitor and the workers. Jobs mid-stage are left for resume.
    pub async fn shutdown(self) {
        self.monitor.shutdown().await;
        self.workers.shutdown().await;
        info!(runner = %self.orchestrator.runner_id(), "pipeline runtime stopped");
    }
}
