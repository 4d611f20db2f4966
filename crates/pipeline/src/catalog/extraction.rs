use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::job::JobInput;
use crate::provider::{AiProvider, AnalyzeRequest};
use crate::stage::{StageContext, StageError, StageExecutor, StageResult};

use super::{ExtractedDocument, Page};

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    pages: Vec<Page>,
}

/// Page numbers must be unique, and image keys unique within a page, since
/// downstream item keys are built from them.
fn check_keys(pages: &[Page]) -> Result<(), StageError> {
    for pair in pages.windows(2) {
        if pair[0].number == pair[1].number {
            return Err(StageError::fatal(format!(
                "malformed extraction output: page {} listed twice",
                pair[0].number
            )));
        }
    }
    for page in pages {
        let mut seen = HashSet::new();
        if let Some(dup) = page.images.iter().find(|image| !seen.insert(image.key.as_str())) {
            return Err(StageError::fatal(format!(
                "malformed extraction output: image key {} repeated on page {}",
                dup.key, page.number
            )));
        }
    }
    Ok(())
}

/// Asks the provider for the document's pages (text and image references).
pub struct ExtractionStage {
    provider: Arc<dyn AiProvider>,
}

impl ExtractionStage {
    pub fn new(provider: Arc<dyn AiProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StageExecutor for ExtractionStage {
    async fn execute(
        &self,
        ctx: &StageContext,
        input: serde_json::Value,
    ) -> Result<StageResult, StageError> {
        let input: JobInput = serde_json::from_value(input)?;
        let raw = self
            .provider
            .analyze(AnalyzeRequest::new(
                "extract_document",
                json!({ "document_ref": input.document_ref, "options": input.options }),
            ))
            .await?;

        let response: ExtractionResponse = serde_json::from_value(raw)
            .map_err(|e| StageError::fatal(format!("malformed extraction output: {e}")))?;
        if response.pages.is_empty() {
            return Err(StageError::fatal("document has no pages"));
        }

        let mut pages = response.pages;
        pages.sort_by_key(|p| p.number);
        check_keys(&pages)?;
        let image_count: usize = pages.iter().map(|p| p.images.len()).sum();
        tracing::info!(
            job_id = %ctx.job_id(),
            pages = pages.len(),
            images = image_count,
            "document extracted"
        );

        let summary = format!("{} pages extracted, {image_count} images found", pages.len());
        let processed = pages.len();
        let output = ExtractedDocument {
            document_ref: input.document_ref,
            pages,
        };
        Ok(StageResult::new(serde_json::to_value(output)?)
            .processed(processed)
            .summary(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PageImage;

    fn page(number: u32, keys: &[&str]) -> Page {
        Page {
            number,
            text: String::new(),
            images: keys
                .iter()
                .map(|key| PageImage {
                    key: key.to_string(),
                    uri: format!("s3://catalog/{number}/{key}.png"),
                })
                .collect(),
        }
    }

    #[test]
    fn image_keys_may_repeat_across_pages_but_not_within_one() {
        assert!(check_keys(&[page(1, &["img-0"]), page(2, &["img-0"])]).is_ok());

        let err = check_keys(&[page(1, &["img-0", "img-0"])]).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("image key img-0 repeated on page 1"));
    }

    #[test]
    fn duplicate_page_numbers_are_rejected() {
        let err = check_keys(&[page(3, &[]), page(3, &[])]).unwrap_err();
        assert!(err.to_string().contains("page 3 listed twice"));
    }
}
