//! Content persistence boundary: chunks, images, embeddings, products, relationships.
//!
//! Writes are keyed by `job_id` plus a stable item key, so repeating a write after
//! a re-delivered task or a retried stage overwrites instead of duplicating.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ingest_core::JobId;

use crate::stage::StageError;
use crate::task::TaskFailure;

/// Errors from the content store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    /// Store unreachable or overloaded; worth retrying.
    #[error("content store unavailable: {0}")]
    Unavailable(String),
    /// The record was rejected; retrying the same write cannot help.
    #[error("content rejected: {0}")]
    Rejected(String),
}

impl From<ContentError> for TaskFailure {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::Unavailable(msg) => TaskFailure::retryable(msg),
            ContentError::Rejected(msg) => TaskFailure::Fatal(msg),
        }
    }
}

impl From<ContentError> for StageError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::Unavailable(msg) => StageError::Retryable(msg),
            ContentError::Rejected(msg) => StageError::Fatal(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Chunk,
    Image,
    Embedding,
    Product,
    Relationship,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingKind {
    Text,
    Image,
}

/// A text chunk cut from one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Stable key within the job, e.g. `p3-c1`.
    pub key: String,
    pub page: u32,
    pub index: usize,
    pub text: String,
}

/// An analysed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub key: String,
    pub page: u32,
    pub uri: String,
    pub analysis: serde_json::Value,
}

/// A product confirmed by enrichment, tied to the chunk it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    /// Key of the source chunk; one product per chunk.
    pub key: String,
    pub page: u32,
    pub name: String,
    pub description: String,
    pub source_chunk_id: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Association between two stored items (chunk ↔ image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub source_id: String,
    pub target_id: String,
    pub kind: String,
    pub confidence: f32,
}

/// A stored item as returned by [`ContentStore::query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub job_id: Option<JobId>,
    pub kind: ContentKind,
    pub body: serde_json::Value,
}

/// Query over stored items; `fields` are matched for equality against the body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentFilter {
    pub job_id: Option<JobId>,
    pub kind: Option<ContentKind>,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ContentFilter {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: ContentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn matches(&self, item: &ContentItem) -> bool {
        if self.job_id.is_some() && item.job_id != self.job_id {
            return false;
        }
        if self.kind.is_some_and(|k| k != item.kind) {
            return false;
        }
        self.fields
            .iter()
            .all(|(name, expected)| item.body.get(name) == Some(expected))
    }
}

/// Narrow read/write interface to the content database.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put_chunk(&self, job_id: JobId, chunk: ChunkRecord) -> Result<String, ContentError>;

    async fn put_image(&self, job_id: JobId, image: ImageRecord) -> Result<String, ContentError>;

    async fn put_embedding(
        &self,
        owner_id: &str,
        vector: Vec<f32>,
        kind: EmbeddingKind,
    ) -> Result<String, ContentError>;

    async fn put_product(
        &self,
        job_id: JobId,
        product: ProductRecord,
    ) -> Result<String, ContentError>;

    async fn put_relationship(
        &self,
        job_id: JobId,
        relationship: RelationshipRecord,
    ) -> Result<String, ContentError>;

    async fn query(&self, filter: ContentFilter) -> Result<Vec<ContentItem>, ContentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_job_kind_and_fields() {
        let job_id = JobId::new();
        let item = ContentItem {
            id: "c1".into(),
            job_id: Some(job_id),
            kind: ContentKind::Chunk,
            body: json!({"page": 3, "text": "porcelain tile"}),
        };

        assert!(ContentFilter::for_job(job_id).matches(&item));
        assert!(
            ContentFilter::for_job(job_id)
                .kind(ContentKind::Chunk)
                .field("page", json!(3))
                .matches(&item)
        );
        assert!(!ContentFilter::for_job(job_id).kind(ContentKind::Image).matches(&item));
        assert!(!ContentFilter::for_job(JobId::new()).matches(&item));
        assert!(!ContentFilter::default().field("page", json!(4)).matches(&item));
    }
}
