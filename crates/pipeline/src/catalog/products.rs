//! Two-pass product detection.
//!
//! The first pass runs locally over every stored chunk: it classifies the chunk,
//! drops index, certification, sustainability and spec-table content, and reads
//! whatever product hints the text carries (name, dimensions, designer, colours).
//! The second pass fans out one `product_enrichment` task per remaining candidate;
//! the provider confirms or rejects it and writes the description, after which
//! the product is stored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::content::{ContentStore, ProductRecord};
use crate::provider::{AiProvider, AnalyzeRequest};
use crate::stage::{StageContext, StageError, StageExecutor, StageResult};
use crate::task::{Task, TaskFailure};
use crate::worker::TaskHandler;

use super::{PRODUCT_ENRICHMENT_TASK, ProcessedDocument, StoredProduct};

/// What a chunk of catalog text is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    ProductDescription,
    TechnicalSpecs,
    IndexContent,
    SustainabilityInfo,
    CertificationInfo,
    SupportingContent,
    /// Too short to judge.
    Unclassified,
}

const INDEX_TERMS: &[&str] = &["table of contents", "index", "contents", "signature book"];
const CERTIFICATION_TERMS: &[&str] = &[
    "quality certifications",
    "sustainability certifications",
    "certificados",
    "iso 9001",
    "iso 14001",
];
const SUSTAINABILITY_TERMS: &[&str] = &[
    "sustainability",
    "environmental",
    "sostenibilidad",
    "medioambiental",
];
const TECHNICAL_TERMS: &[&str] = &[
    "technical specifications",
    "technical characteristics",
    "características técnicas",
];
/// Their presence keeps certification or sustainability wording from
/// disqualifying a chunk.
const PRODUCT_TERMS: &[&str] = &["dimensions", "designer", "collection", "×", "cm", "mm"];
const PRODUCT_CONTEXT: &[&str] = &[
    "designer",
    "collection",
    "material",
    "ceramic",
    "porcelain",
    "tile",
    "estudi{h}ac",
    "dsignio",
    "alt design",
    "yonoh",
    "stacy garcia",
];
const NAME_CONTEXT: &[&str] = &["×", "cm", "mm", "designer", "estudi", "dsignio", "yonoh"];
const COLORS: &[&str] = &[
    "TAUPE",
    "SAND",
    "CLAY",
    "WHITE",
    "BLACK",
    "GREY",
    "GRAY",
    "ANTHRACITE",
    "BEIGE",
    "BROWN",
    "MINT",
    "NAVY",
    "BORDEAUX",
];

static STANDALONE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\p{Lu}{2,}(?:\s+\p{Lu}{2,})*$").expect("name pattern"));
static UPPERCASE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\p{Lu}{3,}(?:[ \t]+\p{Lu}{3,})*)\b").expect("run pattern"));
static DIMENSIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:,\d+)?)\s*[×x]\s*(\d+(?:,\d+)?)").expect("dimension pattern")
});
static DESIGNER_BY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:by|BY)[ \t]+(\p{Lu}[\p{L}{}\- \t]*)").expect("designer pattern")
});
static KNOWN_STUDIO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(ESTUDI\{H\}AC|DSIGNIO|ALT DESIGN|YONOH|Stacy Garcia NY)").expect("studio pattern")
});
static COLOR_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b({})\b", COLORS.join("|"))).expect("color pattern")
});

fn is_uppercase_word(word: &str) -> bool {
    word.chars().count() > 2
        && word.chars().any(char::is_uppercase)
        && !word.chars().any(char::is_lowercase)
}

/// Classify `text` without calling out. Chunks shorter than `min_chars` are
/// [`ChunkType::Unclassified`].
///
/// A chunk is a product description when at least two of these hold: it has an
/// uppercase word (a product name), a dimension marker, or product vocabulary.
pub fn classify_chunk(text: &str, min_chars: usize) -> ChunkType {
    if text.trim().chars().count() < min_chars {
        return ChunkType::Unclassified;
    }
    let lower = text.to_lowercase();
    let mentions = |terms: &[&str]| terms.iter().any(|term| lower.contains(term));

    if mentions(INDEX_TERMS) {
        return ChunkType::IndexContent;
    }
    let product_terms = mentions(PRODUCT_TERMS);
    if mentions(CERTIFICATION_TERMS) && !product_terms {
        return ChunkType::CertificationInfo;
    }
    if mentions(SUSTAINABILITY_TERMS) && !product_terms {
        return ChunkType::SustainabilityInfo;
    }
    if mentions(TECHNICAL_TERMS) {
        return ChunkType::TechnicalSpecs;
    }

    let has_name = text.split_whitespace().any(is_uppercase_word);
    let has_dimensions = ["×", "x ", "cm", "mm"].iter().any(|p| text.contains(p));
    let has_context = mentions(PRODUCT_CONTEXT);
    let score = [has_name, has_dimensions, has_context]
        .into_iter()
        .filter(|hit| *hit)
        .count();
    if score >= 2 {
        ChunkType::ProductDescription
    } else {
        ChunkType::SupportingContent
    }
}

/// Product facts read straight off the chunk text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// e.g. `11,8×11,8`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub designer: Option<String>,
    /// Sorted, deduplicated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colors: Vec<String>,
}

impl ProductHints {
    pub fn extract(text: &str) -> Self {
        Self {
            name: product_name(text),
            dimensions: DIMENSIONS
                .captures(text)
                .map(|c| format!("{}×{}", &c[1], &c[2])),
            designer: designer(text),
            colors: COLOR_WORD
                .find_iter(text)
                .map(|m| m.as_str().to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        }
    }

    fn into_metadata(self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// First uppercase name in the leading lines: a standalone uppercase line, or
/// an uppercase run with dimensions or a designer close below it. Trailing
/// colour words are dropped (`VALENOVA TAUPE` becomes `VALENOVA`).
fn product_name(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    for (i, raw) in lines.iter().enumerate().take(10) {
        let line = raw.trim();
        if line.chars().count() <= 20 && STANDALONE_NAME.is_match(line) {
            return Some(strip_colors(line));
        }
        let Some(run) = UPPERCASE_RUN.captures(line).and_then(|c| c.get(1)) else {
            continue;
        };
        let window = lines[i..(i + 3).min(lines.len())].join("\n").to_lowercase();
        if NAME_CONTEXT.iter().any(|p| window.contains(p)) {
            return Some(strip_colors(run.as_str()));
        }
    }
    None
}

fn strip_colors(name: &str) -> String {
    let mut words: Vec<&str> = name.split_whitespace().collect();
    while words.len() > 1 && words.last().is_some_and(|w| COLORS.contains(w)) {
        words.pop();
    }
    words.join(" ")
}

fn designer(text: &str) -> Option<String> {
    let by = DESIGNER_BY
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|name| name.chars().count() > 2);
    by.or_else(|| KNOWN_STUDIO.find(text).map(|m| m.as_str().to_string()))
}

/// Payload of a `product_enrichment` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ProductCandidate {
    key: String,
    page: u32,
    chunk_id: String,
    text: String,
    hints: ProductHints,
}

/// Provider verdict on a candidate.
#[derive(Debug, Deserialize)]
struct Enrichment {
    #[serde(default = "confirmed")]
    is_product: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

fn confirmed() -> bool {
    true
}

/// Result stored on a completed `product_enrichment` task. `product` is empty
/// when the provider rejected the candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EnrichedProduct {
    #[serde(default)]
    product: Option<StoredProduct>,
}

/// Classifies chunks and fans out enrichment for product candidates.
///
/// Rejected candidates complete without a product; dead-lettered ones are
/// reported as failed items.
pub struct ProductDetectionStage {
    min_chunk_chars: usize,
}

impl ProductDetectionStage {
    pub fn new(min_chunk_chars: usize) -> Self {
        Self { min_chunk_chars }
    }
}

#[async_trait]
impl StageExecutor for ProductDetectionStage {
    async fn execute(
        &self,
        ctx: &StageContext,
        input: serde_json::Value,
    ) -> Result<StageResult, StageError> {
        let mut document: ProcessedDocument = serde_json::from_value(input)?;

        let mut chunk_types = BTreeMap::new();
        let mut items = Vec::new();
        for chunk in &document.chunks {
            let kind = classify_chunk(&chunk.text, self.min_chunk_chars);
            chunk_types.insert(chunk.key.clone(), kind);
            if kind != ChunkType::ProductDescription {
                continue;
            }
            let candidate = ProductCandidate {
                key: chunk.key.clone(),
                page: chunk.page,
                chunk_id: chunk.id.clone(),
                text: chunk.text.clone(),
                hints: ProductHints::extract(&chunk.text),
            };
            items.push((chunk.key.clone(), serde_json::to_value(candidate)?));
        }
        let candidates = items.len();
        tracing::info!(
            job_id = %ctx.job_id(),
            chunks = chunk_types.len(),
            candidates,
            "chunks classified"
        );
        if !items.is_empty() {
            ctx.fan_out(PRODUCT_ENRICHMENT_TASK, items).await?;
        }

        let outcome = ctx.await_fan_in(PRODUCT_ENRICHMENT_TASK).await?;
        let results = ctx
            .queue()
            .results(ctx.job_id(), PRODUCT_ENRICHMENT_TASK)
            .await?;

        let mut products = Vec::new();
        for chunk in &document.chunks {
            let Some(result) = results.get(&chunk.key) else {
                continue;
            };
            let enriched: EnrichedProduct = serde_json::from_value(result.clone())?;
            products.extend(enriched.product);
        }

        let summary = format!(
            "{} chunks classified, {candidates} product candidates; {} products stored",
            chunk_types.len(),
            products.len()
        );
        let stored = products.len();
        document.chunk_types = chunk_types;
        document.products = products;
        Ok(StageResult::new(serde_json::to_value(document)?)
            .with_fan_in(&outcome, "candidates", "enriched")
            .processed(stored)
            .summary(summary))
    }
}

/// Worker handler for `product_enrichment` tasks: ask the provider to confirm
/// and describe the candidate, then store it keyed by its source chunk.
pub struct ProductEnrichmentHandler {
    provider: Arc<dyn AiProvider>,
    content: Arc<dyn ContentStore>,
}

impl ProductEnrichmentHandler {
    pub fn new(provider: Arc<dyn AiProvider>, content: Arc<dyn ContentStore>) -> Self {
        Self { provider, content }
    }
}

#[async_trait]
impl TaskHandler for ProductEnrichmentHandler {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskFailure> {
        let candidate: ProductCandidate = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskFailure::fatal(format!("malformed product task payload: {e}")))?;

        let response = self
            .provider
            .analyze(AnalyzeRequest::new(
                "enrich_product",
                json!({ "text": candidate.text, "hints": candidate.hints }),
            ))
            .await?;
        let enrichment: Enrichment = serde_json::from_value(response)
            .map_err(|e| TaskFailure::fatal(format!("malformed enrichment: {e}")))?;

        if !enrichment.is_product {
            tracing::debug!(job_id = %task.job_id, item_id = %task.item_id, "candidate rejected");
            return serde_json::to_value(EnrichedProduct { product: None })
                .map_err(|e| TaskFailure::fatal(e.to_string()));
        }

        let name = enrichment
            .name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| candidate.hints.name.clone())
            .ok_or_else(|| TaskFailure::fatal("confirmed product has no name"))?;
        let mut metadata = candidate.hints.into_metadata();
        metadata.extend(enrichment.metadata);

        let product_id = self
            .content
            .put_product(
                task.job_id,
                ProductRecord {
                    key: candidate.key.clone(),
                    page: candidate.page,
                    name: name.clone(),
                    description: enrichment.description,
                    source_chunk_id: candidate.chunk_id,
                    confidence: enrichment.confidence,
                    metadata,
                },
            )
            .await?;

        serde_json::to_value(EnrichedProduct {
            product: Some(StoredProduct {
                key: candidate.key,
                page: candidate.page,
                product_id,
                name,
            }),
        })
        .map_err(|e| TaskFailure::fatal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALENOVA: &str = "39661  VALENOVA TAUPE LT/11,8X11,8\n\
        Q59 (11,8x11,8 cm − 4[5/8]x4[5/8]\")\n\
        12 patterns · ** 43 Kerakoll\n\
        39660  VALENOVA SAND LT/11,8X11,8\n\
        Q59 (11,8x11,8 cm − 4[5/8]x4[5/8]\")\n\
        39658  VALENOVA WHITE LT/11,8X11,8\n\
        by Stacy Garcia NY";

    const PIQUE: &str = "PIQUÉ\nby Estudi{H}ac\n\n\
        PIQUÉ, a new collection for HARMONY by José Manuel Ferrero from design studio \
        estudi{H}ac, is inspired by an 18th century technique for weaving double cloth.";

    #[test]
    fn filler_pages_are_not_product_candidates() {
        let index = "INDEX\nSignature book\nSustainability 8\nFOLD 6\nBEAT 8\nVALENOVA 23\n\
            PIQUÉ 38\nONA 52\nMARE 66\nLOG 74";
        assert_eq!(classify_chunk(index, 50), ChunkType::IndexContent);

        let sustainability = "Sostenibilidad. Medioambiental y social. El respeto por el \
            entorno y el compromiso con la sostenibilidad son fundamentales para HARMONY.";
        assert_eq!(classify_chunk(sustainability, 50), ChunkType::SustainabilityInfo);

        let certification = "Quality certifications. Quality management system in \
            compliance with UNE-EN ISO 9001:2015 and UNE-EN ISO 14001:2015.";
        assert_eq!(classify_chunk(certification, 50), ChunkType::CertificationInfo);

        assert_eq!(classify_chunk("VALENOVA 60x60", 50), ChunkType::Unclassified);
        assert_eq!(
            classify_chunk("Welcome to our catalog of design solutions for modern spaces.", 10),
            ChunkType::SupportingContent
        );
    }

    #[test]
    fn product_chunks_are_candidates() {
        assert_eq!(classify_chunk(VALENOVA, 100), ChunkType::ProductDescription);
        assert_eq!(classify_chunk(PIQUE, 100), ChunkType::ProductDescription);
    }

    #[test]
    fn hints_are_read_from_product_text() {
        let hints = ProductHints::extract(VALENOVA);
        assert_eq!(hints.name.as_deref(), Some("VALENOVA"));
        assert_eq!(hints.dimensions.as_deref(), Some("11,8×11,8"));
        assert_eq!(hints.designer.as_deref(), Some("Stacy Garcia NY"));
        assert_eq!(hints.colors, vec!["SAND", "TAUPE", "WHITE"]);

        let hints = ProductHints::extract(PIQUE);
        assert_eq!(hints.name.as_deref(), Some("PIQUÉ"));
        assert_eq!(hints.designer.as_deref(), Some("Estudi{H}ac"));
        assert_eq!(hints.dimensions, None);
    }

    #[test]
    fn hints_become_flat_metadata() {
        let metadata = ProductHints {
            name: Some("LINS".into()),
            dimensions: Some("20×20".into()),
            designer: None,
            colors: vec!["MINT".into()],
        }
        .into_metadata();
        assert_eq!(metadata.get("dimensions"), Some(&json!("20×20")));
        assert_eq!(metadata.get("colors"), Some(&json!(["MINT"])));
        assert!(!metadata.contains_key("designer"));
    }
}
