//! Stage catalog for catalog-PDF ingestion.
//!
//! | stage | band | fan-out |
//! |-------|------|---------|
//! | `extraction` | 0–15 | |
//! | `chunking` | 15–40 | `chunk_embedding` |
//! | `image-processing` | 40–65 | `image_embedding` |
//! | `product-detection` | 65–85 | `product_enrichment` |
//! | `relationship-building` | 85–100 | |

mod chunking;
mod extraction;
mod images;
mod products;
mod relationships;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ingest_core::DomainResult;

use crate::config::PipelineConfig;
use crate::content::ContentStore;
use crate::provider::AiProvider;
use crate::stage::{PipelineDefinition, ProgressBand, StageExecutor, StageSpec};
use crate::task::TaskFailure;

pub use chunking::{ChunkEmbeddingHandler, ChunkingStage, split_into_chunks};
pub use extraction::ExtractionStage;
pub use images::{ImageEmbeddingHandler, ImageProcessingStage};
pub use products::{
    ChunkType, ProductDetectionStage, ProductEnrichmentHandler, ProductHints, classify_chunk,
};
pub use relationships::RelationshipStage;

pub const EXTRACTION: &str = "extraction";
pub const CHUNKING: &str = "chunking";
pub const IMAGE_PROCESSING: &str = "image-processing";
pub const PRODUCT_DETECTION: &str = "product-detection";
pub const RELATIONSHIP_BUILDING: &str = "relationship-building";

pub const CHUNK_EMBEDDING_TASK: &str = "chunk_embedding";
pub const IMAGE_EMBEDDING_TASK: &str = "image_embedding";
pub const PRODUCT_ENRICHMENT_TASK: &str = "product_enrichment";

/// An image reference found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    pub key: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<PageImage>,
}

/// Extraction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub document_ref: String,
    pub pages: Vec<Page>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub key: String,
    pub page: u32,
    pub text: String,
}

/// An image to analyze. `key` is scoped to the page, e.g. `p3-img-0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub key: String,
    pub page: u32,
    pub uri: String,
}

/// Chunking output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedDocument {
    pub document_ref: String,
    pub chunks: Vec<StoredChunk>,
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    pub key: String,
    pub page: u32,
    pub image_id: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProduct {
    /// Key of the chunk the product was read from.
    pub key: String,
    pub page: u32,
    pub product_id: String,
    pub name: String,
}

/// Image-processing output, extended by product detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub document_ref: String,
    pub chunks: Vec<StoredChunk>,
    pub images: Vec<StoredImage>,
    pub failed_images: Vec<String>,
    #[serde(default)]
    pub chunk_types: BTreeMap<String, ChunkType>,
    #[serde(default)]
    pub products: Vec<StoredProduct>,
}

/// Remove the `embedding` field from a provider response.
fn take_embedding(response: &mut serde_json::Value) -> Result<Vec<f32>, TaskFailure> {
    response
        .as_object_mut()
        .and_then(|fields| fields.remove("embedding"))
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| TaskFailure::fatal(format!("malformed embedding: {e}")))?
        .ok_or_else(|| TaskFailure::fatal("provider returned no embedding"))
}

/// Build the five-stage catalog pipeline.
pub fn catalog_pipeline(
    provider: Arc<dyn AiProvider>,
    content: Arc<dyn ContentStore>,
    config: &PipelineConfig,
) -> DomainResult<PipelineDefinition> {
    let stage = |name: &str,
                 start: u8,
                 end: u8,
                 executor: Arc<dyn StageExecutor>|
     -> DomainResult<StageSpec> {
        Ok(StageSpec::new(name, ProgressBand::new(start, end)?, executor)
            .with_max_retries(config.stage_retry.max_attempts)
            .with_max_duration(config.stage_timeout))
    };

    PipelineDefinition::new(vec![
        stage(EXTRACTION, 0, 15, Arc::new(ExtractionStage::new(provider)))?,
        stage(
            CHUNKING,
            15,
            40,
            Arc::new(ChunkingStage::new(content.clone(), config.max_chunk_chars)),
        )?,
        stage(IMAGE_PROCESSING, 40, 65, Arc::new(ImageProcessingStage))?,
        stage(
            PRODUCT_DETECTION,
            65,
            85,
            Arc::new(ProductDetectionStage::new(config.min_product_chunk_chars)),
        )?,
        stage(
            RELATIONSHIP_BUILDING,
            85,
            100,
            Arc::new(RelationshipStage::new(content)),
        )?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryContentStore;
    use crate::provider::{AnalyzeRequest, ProviderError};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::json;

    struct Unused;

    #[async_trait]
    impl AiProvider for Unused {
        async fn analyze(&self, _: AnalyzeRequest) -> Result<serde_json::Value, ProviderError> {
            Err(ProviderError::Fatal("not called".into()))
        }
    }

    #[test]
    fn stages_take_their_retry_budget_from_the_stage_policy() {
        let config = PipelineConfig {
            stage_retry: RetryPolicy::fixed(7, std::time::Duration::from_secs(1)),
            ..PipelineConfig::default()
        };
        let pipeline =
            catalog_pipeline(Arc::new(Unused), InMemoryContentStore::arc(), &config).unwrap();

        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![EXTRACTION, CHUNKING, IMAGE_PROCESSING, PRODUCT_DETECTION, RELATIONSHIP_BUILDING]
        );
        assert!(pipeline.stages().iter().all(|s| s.max_retries == 7));
    }

    #[test]
    fn embedding_is_taken_out_of_the_response() {
        let mut response = json!({ "label": "tile", "embedding": [0.5, 0.25] });
        assert_eq!(take_embedding(&mut response).unwrap(), vec![0.5, 0.25]);
        assert_eq!(response, json!({ "label": "tile" }));

        assert!(matches!(
            take_embedding(&mut json!({ "label": "tile" })),
            Err(TaskFailure::Fatal(_))
        ));
        assert!(matches!(
            take_embedding(&mut json!({ "embedding": "nope" })),
            Err(TaskFailure::Fatal(_))
        ));
    }
}
