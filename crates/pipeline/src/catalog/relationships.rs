use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::content::{ContentStore, RelationshipRecord};
use crate::stage::{StageContext, StageError, StageExecutor, StageResult};

use super::{ProcessedDocument, StoredChunk, StoredImage};

const SAME_PAGE: &str = "same_page";
/// Weight of page co-location in the association score.
const SPATIAL_WEIGHT: f32 = 0.4;
/// Added when the chunk mentions the image's label.
const CAPTION_WEIGHT: f32 = 0.3;

fn confidence(chunk: &StoredChunk, image: &StoredImage) -> f32 {
    let mentions_label = image
        .label
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .is_some_and(|label| chunk.text.to_lowercase().contains(&label.to_lowercase()));
    if mentions_label {
        SPATIAL_WEIGHT + CAPTION_WEIGHT
    } else {
        SPATIAL_WEIGHT
    }
}

/// Associates each stored image with the chunks on its page.
pub struct RelationshipStage {
    content: Arc<dyn ContentStore>,
}

impl RelationshipStage {
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self { content }
    }
}

#[async_trait]
impl StageExecutor for RelationshipStage {
    async fn execute(
        &self,
        ctx: &StageContext,
        input: serde_json::Value,
    ) -> Result<StageResult, StageError> {
        let document: ProcessedDocument = serde_json::from_value(input)?;

        let mut built = 0usize;
        let total = document.images.len();
        for (done, image) in document.images.iter().enumerate() {
            for chunk in document.chunks.iter().filter(|c| c.page == image.page) {
                self.content
                    .put_relationship(
                        ctx.job_id(),
                        RelationshipRecord {
                            source_id: chunk.id.clone(),
                            target_id: image.image_id.clone(),
                            kind: SAME_PAGE.to_string(),
                            confidence: confidence(chunk, image),
                        },
                    )
                    .await?;
                built += 1;
            }
            ctx.report_progress(done + 1, total).await?;
        }

        let summary = format!("{built} chunk-image relationships built");
        Ok(StageResult::new(json!({
            "document_ref": document.document_ref,
            "chunks": document.chunks.len(),
            "images": document.images.len(),
            "products": document.products.len(),
            "relationships": built,
            "failed_images": document.failed_images,
        }))
        .processed(built)
        .summary(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_mentions_raise_confidence() {
        let chunk = StoredChunk {
            id: "c1".into(),
            key: "p1-c0".into(),
            page: 1,
            text: "The VALENOVA collection in matte white.".into(),
        };
        let mut image = StoredImage {
            key: "p1-img-1".into(),
            page: 1,
            image_id: "i1".into(),
            label: Some("Valenova".into()),
        };
        assert_eq!(confidence(&chunk, &image), SPATIAL_WEIGHT + CAPTION_WEIGHT);

        image.label = None;
        assert_eq!(confidence(&chunk, &image), SPATIAL_WEIGHT);
    }
}
