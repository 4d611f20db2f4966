use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::content::{ContentStore, EmbeddingKind, ImageRecord};
use crate::provider::{AiProvider, AnalyzeRequest};
use crate::stage::{StageContext, StageError, StageExecutor, StageResult};
use crate::task::{Task, TaskFailure};
use crate::worker::TaskHandler;

use super::{
    ChunkedDocument, IMAGE_EMBEDDING_TASK, ImageRef, ProcessedDocument, StoredImage, take_embedding,
};

/// Result stored on a completed `image_embedding` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EmbeddedImage {
    image_id: String,
    embedding_id: String,
    #[serde(default)]
    label: Option<String>,
}

/// Fans out one `image_embedding` task per image and waits for them.
///
/// Dead-lettered images are reported as failed items; the stage itself succeeds.
pub struct ImageProcessingStage;

#[async_trait]
impl StageExecutor for ImageProcessingStage {
    async fn execute(
        &self,
        ctx: &StageContext,
        input: serde_json::Value,
    ) -> Result<StageResult, StageError> {
        let document: ChunkedDocument = serde_json::from_value(input)?;

        let mut items = Vec::with_capacity(document.images.len());
        for image in &document.images {
            items.push((image.key.clone(), serde_json::to_value(image)?));
        }
        if !items.is_empty() {
            ctx.fan_out(IMAGE_EMBEDDING_TASK, items).await?;
        }

        let outcome = ctx.await_fan_in(IMAGE_EMBEDDING_TASK).await?;
        let results = ctx
            .queue()
            .results(ctx.job_id(), IMAGE_EMBEDDING_TASK)
            .await?;

        let mut images = Vec::with_capacity(results.len());
        for image in &document.images {
            let Some(result) = results.get(&image.key) else {
                continue;
            };
            let embedded: EmbeddedImage = serde_json::from_value(result.clone())?;
            images.push(StoredImage {
                key: image.key.clone(),
                page: image.page,
                image_id: embedded.image_id,
                label: embedded.label,
            });
        }

        let output = ProcessedDocument {
            document_ref: document.document_ref,
            chunks: document.chunks,
            images,
            failed_images: outcome.failed_item_ids.clone(),
            chunk_types: Default::default(),
            products: Vec::new(),
        };
        Ok(StageResult::new(serde_json::to_value(output)?).with_fan_in(
            &outcome,
            "images",
            "embedded",
        ))
    }
}

/// Worker handler for `image_embedding` tasks: analyze, store, embed.
///
/// Writes are keyed by the image key, so a redelivered task overwrites its
/// own earlier records rather than duplicating them.
pub struct ImageEmbeddingHandler {
    provider: Arc<dyn AiProvider>,
    content: Arc<dyn ContentStore>,
}

impl ImageEmbeddingHandler {
    pub fn new(provider: Arc<dyn AiProvider>, content: Arc<dyn ContentStore>) -> Self {
        Self { provider, content }
    }
}

#[async_trait]
impl TaskHandler for ImageEmbeddingHandler {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskFailure> {
        let image: ImageRef = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskFailure::fatal(format!("malformed image task payload: {e}")))?;

        let mut analysis = self
            .provider
            .analyze(AnalyzeRequest::new(
                "analyze_image",
                json!({ "uri": image.uri, "page": image.page }),
            ))
            .await?;

        let embedding = take_embedding(&mut analysis)?;
        let label = analysis
            .get("label")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let image_id = self
            .content
            .put_image(
                task.job_id,
                ImageRecord {
                    key: image.key.clone(),
                    page: image.page,
                    uri: image.uri.clone(),
                    analysis,
                },
            )
            .await?;
        let embedding_id = self
            .content
            .put_embedding(&image_id, embedding, EmbeddingKind::Image)
            .await?;

        serde_json::to_value(EmbeddedImage {
            image_id,
            embedding_id,
            label,
        })
        .map_err(|e| TaskFailure::fatal(e.to_string()))
    }
}
