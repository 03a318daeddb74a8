//! Input checks run before any OCR call.

use image::{GenericImageView, ImageFormat};

use super::ExtractionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: &'static str,
    pub width: u32,
    pub height: u32,
}

fn format_name(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("png"),
        ImageFormat::Jpeg => Some("jpeg"),
        ImageFormat::Tiff => Some("tiff"),
        _ => None,
    }
}

/// Reject empty, oversized, unsupported or undecodable images.
pub fn validate_image(bytes: &[u8], max_bytes: usize) -> Result<ImageInfo, ExtractionError> {
    if bytes.is_empty() {
        return Err(ExtractionError::EmptyImage);
    }
    if bytes.len() > max_bytes {
        return Err(ExtractionError::ImageTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let format = image::guess_format(bytes)
        .map_err(|e| ExtractionError::UnsupportedFormat(e.to_string()))?;
    let name = format_name(format)
        .ok_or_else(|| ExtractionError::UnsupportedFormat(format!("{format:?}")))?;

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ExtractionError::Undecodable(e.to_string()))?;
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(ExtractionError::Undecodable("image has no pixels".into()));
    }

    Ok(ImageInfo {
        format: name,
        width,
        height,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat};
    use std::io::Cursor;

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::new_rgb8(width, height)
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    #[test]
    fn accepts_valid_png() {
        let info = validate_image(&png_bytes(8, 4), 5 * 1024 * 1024).unwrap();
        assert_eq!(info.format, "png");
        assert_eq!((info.width, info.height), (8, 4));
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(validate_image(&[], 100), Err(ExtractionError::EmptyImage)));
    }

    #[test]
    fn rejects_oversized() {
        let bytes = png_bytes(8, 8);
        let err = validate_image(&bytes, 10).unwrap_err();
        assert!(matches!(err, ExtractionError::ImageTooLarge { max: 10, .. }));
        assert!(err.is_input_error());
    }

    #[test]
    fn rejects_unknown_format() {
        let err = validate_image(b"definitely not an image", 1024).unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedFormat(_)));
    }

    #[test]
    fn rejects_truncated_png() {
        let bytes = png_bytes(16, 16);
        let err = validate_image(&bytes[..bytes.len() / 2], 1024 * 1024).unwrap_err();
        assert!(matches!(err, ExtractionError::Undecodable(_)));
    }
}
