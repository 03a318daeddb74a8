//! Label OCR through a local Ollama vision model.
//!
//! The model transcribes the packaging text and appends a classification tag
//! (`[FOOD_LABEL]` or `[OTHER]`) so callers can warn when the photo does not
//! look like a food label.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use tracing::Instrument;

use super::types::{ExtractedText, ImageContentType, TextExtractor};
use super::ExtractionError;
use crate::pipeline::ollama::{GenerationOptions, OllamaClient};

// ──────────────────────────────────────────────
// Constants
// ──────────────────────────────────────────────

const FOOD_LABEL_TAG: &str = "[FOOD_LABEL]";
const OTHER_TAG: &str = "[OTHER]";

const SYSTEM_PROMPT: &str = "\
You are a food packaging text extractor. Transcribe ALL visible text from the \
photographed label exactly as printed: product name, ingredient list, allergen \
statements and the nutrition facts table. Do not summarize or add commentary.";

const USER_PROMPT: &str = "\
Extract all visible text from this food label. Keep the ingredient list in its \
printed order. Write nutrition facts one nutrient per line with amount and unit. \
At the very end, on a new line, write exactly [FOOD_LABEL] if this is food \
packaging or a nutrition label, or [OTHER] if it is not.";

const OCR_OPTIONS: GenerationOptions = GenerationOptions {
    temperature: 0.0,
    num_predict: 2048,
};

// ──────────────────────────────────────────────
// OllamaVisionOcr
// ──────────────────────────────────────────────

pub struct OllamaVisionOcr {
    client: Arc<OllamaClient>,
    model_name: String,
}

impl OllamaVisionOcr {
    pub fn new(client: Arc<OllamaClient>, model_name: impl Into<String>) -> Self {
        Self {
            client,
            model_name: model_name.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn transcribe(&self, image_bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        let start = std::time::Instant::now();

        let images = vec![base64::engine::general_purpose::STANDARD.encode(image_bytes)];
        let raw_response = self
            .client
            .chat_with_images(&self.model_name, SYSTEM_PROMPT, USER_PROMPT, images, OCR_OPTIONS)
            .await
            .map_err(|e| ExtractionError::OcrProcessing(format!("Vision OCR failed: {e}")))?;

        let (text, content_type) = parse_classification_tag(&raw_response);
        if text.is_empty() {
            return Err(ExtractionError::NoText);
        }
        let confidence = compute_heuristic_confidence(&text);

        tracing::info!(
            elapsed_ms = %start.elapsed().as_millis(),
            text_len = text.len(),
            confidence,
            content_type = ?content_type,
            "Vision OCR extraction complete"
        );

        Ok(ExtractedText {
            text,
            confidence,
            content_type,
        })
    }
}

#[async_trait]
impl TextExtractor for OllamaVisionOcr {
    async fn extract(&self, image_bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        let span = tracing::info_span!(
            "vision_ocr_extract",
            model = %self.model_name,
            image_size = image_bytes.len(),
        );
        self.transcribe(image_bytes).instrument(span).await
    }
}

// ──────────────────────────────────────────────
// Classification tag parsing
// ──────────────────────────────────────────────

/// Strip the trailing classification tag. Untagged output counts as a food
/// label.
fn parse_classification_tag(response: &str) -> (String, ImageContentType) {
    let trimmed = response.trim();

    if let Some(text) = trimmed.strip_suffix(OTHER_TAG) {
        (text.trim().to_string(), ImageContentType::Other)
    } else if let Some(text) = trimmed.strip_suffix(FOOD_LABEL_TAG) {
        (text.trim().to_string(), ImageContentType::FoodLabel)
    } else {
        (trimmed.to_string(), ImageContentType::FoodLabel)
    }
}

// ──────────────────────────────────────────────
// Confidence heuristic
// ──────────────────────────────────────────────

/// Estimate OCR confidence from the shape of the transcription.
///
/// Vision models report no per-word confidence, so the score comes from:
///
/// 1. **Text length**: 1-49 chars → 0.2, 50-199 → 0.4, 200-499 → 0.6,
///    500+ → 0.8.
/// 2. **Label markers** (bonus):
///    - an ingredients heading → +0.05
///    - at least two lines with a quantity and unit (`12 g`, `140mg`, `5%`) → +0.05
///    - table pipes `|` → +0.03
///
/// Capped at 0.95.
fn compute_heuristic_confidence(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }

    let len = text.chars().count();
    let base: f32 = if len < 50 {
        0.2
    } else if len < 200 {
        0.4
    } else if len < 500 {
        0.6
    } else {
        0.8
    };

    let lower = text.to_lowercase();
    let has_ingredients = lower.contains("ingredients");
    let quantity_lines = text.lines().filter(|l| has_quantity(l)).count();
    let has_tables = text.lines().any(|l| l.matches('|').count() >= 2);

    let bonus: f32 = if has_ingredients { 0.05 } else { 0.0 }
        + if quantity_lines >= 2 { 0.05 } else { 0.0 }
        + if has_tables { 0.03 } else { 0.0 };

    (base + bonus).min(0.95)
}

/// A number followed (optionally after a space) by g, mg, mcg, kcal, kj or %.
fn has_quantity(line: &str) -> bool {
    let lower = line.to_lowercase();
    let bytes = lower.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if !b.is_ascii_digit() {
            continue;
        }
        let rest = lower[i + 1..].trim_start_matches(|c: char| c.is_ascii_digit() || c == '.');
        let rest = rest.trim_start();
        if rest.starts_with('%')
            || ["mg", "mcg", "g", "kcal", "kj"]
                .iter()
                .any(|unit| rest.starts_with(unit) && !rest[unit.len()..].starts_with(char::is_alphabetic))
        {
            return true;
        }
    }
    false
}

// ──────────────────────────────────────────────
// MockTextExtractor (testing)
// ──────────────────────────────────────────────

#[cfg(test)]
pub(crate) struct MockTextExtractor {
    response: Result<ExtractedText, String>,
    pub(crate) calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockTextExtractor {
    pub(crate) fn new(text: &str, confidence: f32) -> Self {
        Self {
            response: Ok(ExtractedText {
                text: text.to_string(),
                confidence,
                content_type: ImageContentType::FoodLabel,
            }),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_content_type(mut self, content_type: ImageContentType) -> Self {
        if let Ok(extracted) = self.response.as_mut() {
            extracted.content_type = content_type;
        }
        self
    }
}

#[cfg(test)]
#[async_trait]
impl TextExtractor for MockTextExtractor {
    async fn extract(&self, _image_bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.response
            .clone()
            .map_err(ExtractionError::OcrProcessing)
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
