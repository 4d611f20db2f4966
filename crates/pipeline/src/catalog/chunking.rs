use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::content::{ChunkRecord, ContentStore, EmbeddingKind};
use crate::provider::{AiProvider, AnalyzeRequest};
use crate::stage::{StageContext, StageError, StageExecutor, StageResult};
use crate::task::{Task, TaskFailure};
use crate::worker::TaskHandler;

use super::{
    CHUNK_EMBEDDING_TASK, ChunkedDocument, ExtractedDocument, ImageRef, StoredChunk,
    take_embedding,
};

/// Payload of a `chunk_embedding` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChunkToEmbed {
    chunk_id: String,
    text: String,
}

/// Split `text` into paragraph-bounded chunks of at most `max_chars` characters.
///
/// Paragraphs (separated by blank lines) are packed together while they fit.
/// A paragraph longer than `max_chars` is split at whitespace, or mid-word when
/// a single word is too long.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        for piece in split_long(paragraph, max_chars) {
            let joined_len = if current.is_empty() {
                piece.chars().count()
            } else {
                current.chars().count() + 2 + piece.chars().count()
            };
            if joined_len > max_chars && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_long(paragraph: &str, max_chars: usize) -> Vec<String> {
    if paragraph.chars().count() <= max_chars {
        return vec![paragraph.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in paragraph.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            let rest = word.split_off(max_chars);
            pieces.push(word.into_iter().collect());
            word = rest;
        }
        let current_len = current.chars().count();
        if current_len > 0 && current_len + 1 + word.len() > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.extend(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Splits page text into chunks, stores them, then embeds each one through a
/// `chunk_embedding` fan-out.
///
/// A chunk whose embedding is dead-lettered stays stored and is reported as a
/// failed item.
pub struct ChunkingStage {
    content: Arc<dyn ContentStore>,
    max_chars: usize,
}

impl ChunkingStage {
    pub fn new(content: Arc<dyn ContentStore>, max_chars: usize) -> Self {
        Self { content, max_chars }
    }
}

#[async_trait]
impl StageExecutor for ChunkingStage {
    async fn execute(
        &self,
        ctx: &StageContext,
        input: serde_json::Value,
    ) -> Result<StageResult, StageError> {
        let document: ExtractedDocument = serde_json::from_value(input)?;

        let mut planned = Vec::new();
        let mut images = Vec::new();
        for page in &document.pages {
            for (index, text) in split_into_chunks(&page.text, self.max_chars).into_iter().enumerate() {
                planned.push(ChunkRecord {
                    key: format!("p{}-c{index}", page.number),
                    page: page.number,
                    index,
                    text,
                });
            }
            images.extend(page.images.iter().map(|image| ImageRef {
                key: format!("p{}-{}", page.number, image.key),
                page: page.number,
                uri: image.uri.clone(),
            }));
        }

        let total = planned.len();
        let mut chunks = Vec::with_capacity(total);
        for record in planned {
            let key = record.key.clone();
            let page = record.page;
            let text = record.text.clone();
            let id = self.content.put_chunk(ctx.job_id(), record).await?;
            chunks.push(StoredChunk { id, key, page, text });
        }

        let mut items = Vec::with_capacity(total);
        for chunk in &chunks {
            let payload = ChunkToEmbed {
                chunk_id: chunk.id.clone(),
                text: chunk.text.clone(),
            };
            items.push((chunk.key.clone(), serde_json::to_value(payload)?));
        }
        if !items.is_empty() {
            ctx.fan_out(CHUNK_EMBEDDING_TASK, items).await?;
        }
        let outcome = ctx.await_fan_in(CHUNK_EMBEDDING_TASK).await?;

        let summary = format!(
            "{total} chunks stored; {}",
            outcome.summary("chunks", "embedded")
        );
        let output = ChunkedDocument {
            document_ref: document.document_ref,
            chunks,
            images,
        };
        Ok(StageResult::new(serde_json::to_value(output)?)
            .processed(total)
            .failed_items(outcome.failed_item_ids)
            .summary(summary))
    }
}

/// Worker handler for `chunk_embedding` tasks.
///
/// The embedding id is derived from the chunk id, so a redelivered task
/// replaces the vector it wrote before.
pub struct ChunkEmbeddingHandler {
    provider: Arc<dyn AiProvider>,
    content: Arc<dyn ContentStore>,
}

impl ChunkEmbeddingHandler {
    pub fn new(provider: Arc<dyn AiProvider>, content: Arc<dyn ContentStore>) -> Self {
        Self { provider, content }
    }
}

#[async_trait]
impl TaskHandler for ChunkEmbeddingHandler {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskFailure> {
        let chunk: ChunkToEmbed = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskFailure::fatal(format!("malformed chunk task payload: {e}")))?;

        let mut response = self
            .provider
            .analyze(AnalyzeRequest::new("embed_text", json!({ "text": chunk.text })))
            .await?;
        let embedding = take_embedding(&mut response)?;
        let embedding_id = self
            .content
            .put_embedding(&chunk.chunk_id, embedding, EmbeddingKind::Text)
            .await?;

        Ok(json!({ "chunk_id": chunk.chunk_id, "embedding_id": embedding_id }))
    }
}
