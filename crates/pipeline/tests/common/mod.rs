#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use ingest_pipeline::{
    AiProvider, AnalyzeRequest, FanInPolling, InMemoryJobStore, InMemoryTaskStore,
    OrchestratorConfig, PipelineDefinition, PipelineOrchestrator, ProgressBand, ProviderError,
    RetryPolicy, StageContext, StageError, StageExecutor, StageResult, StageSpec, TaskQueue,
};

/// Shared record of which stage ran for which document.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Appends its name to the `trail` carried through stage outputs.
pub struct TrailStage {
    pub name: &'static str,
    pub log: CallLog,
}

#[async_trait]
impl StageExecutor for TrailStage {
    async fn execute(&self, ctx: &StageContext, input: Value) -> Result<StageResult, StageError> {
        self.log.push(format!("{}:{}", ctx.input().document_ref, self.name));
        let mut trail: Vec<String> = input
            .get("trail")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        trail.push(self.name.to_string());
        Ok(StageResult::new(json!({
            "document_ref": ctx.input().document_ref,
            "trail": trail,
        }))
        .processed(1))
    }
}

pub fn band(start: u8, end: u8) -> ProgressBand {
    ProgressBand::new(start, end).unwrap()
}

/// Stages A [0,30), B [30,60), C [60,100].
pub fn abc_pipeline(log: &CallLog) -> PipelineDefinition {
    let stage = |name: &'static str, start, end| {
        StageSpec::new(
            name,
            band(start, end),
            Arc::new(TrailStage {
                name,
                log: log.clone(),
            }),
        )
    };
    PipelineDefinition::new(vec![stage("A", 0, 30), stage("B", 30, 60), stage("C", 60, 100)])
        .unwrap()
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        heartbeat_interval: Duration::from_millis(20),
        stage_retry: RetryPolicy::fixed(5, Duration::ZERO),
        task_max_attempts: 3,
        fan_in: FanInPolling {
            initial: Duration::from_millis(2),
            max: Duration::from_millis(20),
        },
        autostart: false,
    }
}

pub fn fast_queue(tasks: Arc<InMemoryTaskStore>) -> TaskQueue {
    TaskQueue::new(tasks, RetryPolicy::fixed(3, Duration::from_millis(1)))
}

pub struct Harness {
    pub jobs: Arc<InMemoryJobStore>,
    pub tasks: Arc<InMemoryTaskStore>,
    pub queue: TaskQueue,
}

impl Harness {
    pub fn new() -> Self {
        ingest_observability::init_for_tests();
        let jobs = InMemoryJobStore::arc();
        let tasks = InMemoryTaskStore::arc();
        let queue = fast_queue(tasks.clone());
        Self { jobs, tasks, queue }
    }

    /// A fresh runner over the same stores, as if started in a new process.
    pub fn runner(&self, pipeline: PipelineDefinition) -> PipelineOrchestrator {
        PipelineOrchestrator::new(self.jobs.clone(), self.queue.clone(), pipeline, test_config())
    }
}

/// Poll `check` until it returns true or the timeout passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within {timeout:?}");
}

/// Provider double for catalog ingestion.
///
/// `extract_document` returns the configured pages. `analyze_image` returns a
/// small embedding, except for URIs listed as transient or fatal failures.
/// `embed_text` always succeeds. `enrich_product` confirms candidates under
/// their hinted name unless that name is listed in `rejected_products`.
#[derive(Default)]
pub struct FakeProvider {
    pub pages: Value,
    pub transient_uris: HashSet<String>,
    pub fatal_uris: HashSet<String>,
    pub rejected_products: HashSet<String>,
    pub calls: Mutex<HashMap<String, usize>>,
}

impl FakeProvider {
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AiProvider for FakeProvider {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<Value, ProviderError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.operation.clone())
            .or_default() += 1;

        match request.operation.as_str() {
            "extract_document" => Ok(json!({ "pages": self.pages })),
            "analyze_image" => {
                let uri = request.payload["uri"].as_str().unwrap_or_default().to_string();
                if self.transient_uris.contains(&uri) {
                    return Err(ProviderError::Transient(format!("{uri}: upstream 503")));
                }
                if self.fatal_uris.contains(&uri) {
                    return Err(ProviderError::Fatal(format!("{uri}: unsupported format")));
                }
                Ok(json!({
                    "label": uri.rsplit('/').next().unwrap_or_default().trim_end_matches(".png"),
                    "embedding": [0.1, 0.2, 0.3],
                }))
            }
            "embed_text" => Ok(json!({ "embedding": [0.4, 0.5, 0.6] })),
            "enrich_product" => {
                let name = request.payload["hints"]["name"].as_str().unwrap_or_default();
                if self.rejected_products.contains(name) {
                    return Ok(json!({ "is_product": false }));
                }
                let text = request.payload["text"].as_str().unwrap_or_default();
                Ok(json!({
                    "name": name,
                    "description": text.lines().next().unwrap_or_default(),
                    "confidence": 0.9,
                    "metadata": { "source": "fake" },
                }))
            }
            other => Err(ProviderError::Fatal(format!("unknown operation {other}"))),
        }
    }
}
