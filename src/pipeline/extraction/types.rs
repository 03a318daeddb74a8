use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ExtractionError;

/// What the vision model believes the photo shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageContentType {
    /// Ingredient list, nutrition facts or other packaging text.
    FoodLabel,
    /// Anything else; the text may be unrelated to food.
    Other,
}

/// Result of text extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub text: String,
    /// 0.0-1.0
    pub confidence: f32,
    pub content_type: ImageContentType,
}

/// Image bytes to label text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, image_bytes: &[u8]) -> Result<ExtractedText, ExtractionError>;
}
