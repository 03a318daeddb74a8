//! Text extraction from food label photos.

pub mod image_guard;
pub mod types;
pub mod vision_ocr;

pub use image_guard::{validate_image, ImageInfo};
pub use types::*;
pub use vision_ocr::OllamaVisionOcr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Image is empty")]
    EmptyImage,

    #[error("Image is {size} bytes, larger than the {max}-byte limit")]
    ImageTooLarge { size: usize, max: usize },

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Image could not be decoded: {0}")]
    Undecodable(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("No text found in image")]
    NoText,
}

impl ExtractionError {
    /// Problems with the photo itself rather than with the OCR backend.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyImage
                | Self::ImageTooLarge { .. }
                | Self::UnsupportedFormat(_)
                | Self::Undecodable(_)
                | Self::NoText
        )
    }
}
