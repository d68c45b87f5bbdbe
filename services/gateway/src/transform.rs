use crate::config::PipelineConfig;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

/// Errors from decoding or deriving variants. All terminal and
/// non-retryable: the same bytes will fail the same way next time.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unrecognized or unsupported image format")]
    UnsupportedFormat,

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("image dimensions {width}x{height} exceed pixel limit {limit}")]
    TooManyPixels { width: u32, height: u32, limit: u64 },

    #[error("{label} variant encode failed: {message}")]
    Encode { label: &'static str, message: String },
}

/// Image format detected from content, independent of the declared mime type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    Jpeg,
    Png,
    Webp,
}

impl SniffedFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            SniffedFormat::Jpeg => "image/jpeg",
            SniffedFormat::Png => "image/png",
            SniffedFormat::Webp => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SniffedFormat::Jpeg => "jpg",
            SniffedFormat::Png => "png",
            SniffedFormat::Webp => "webp",
        }
    }
}

/// Detect the image format from magic bytes.
///
/// Runs before any decode work so that arbitrary non-image payloads with a
/// plausible mime type are rejected cheaply.
pub fn sniff_format(bytes: &[u8]) -> Option<SniffedFormat> {
    if bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF {
        return Some(SniffedFormat::Jpeg);
    }
    if bytes.len() >= 8 && bytes[..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some(SniffedFormat::Png);
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(SniffedFormat::Webp);
    }
    None
}

/// One encoded derived image
#[derive(Debug, Clone)]
pub struct EncodedVariant {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// The complete derived set for one source image.
///
/// Constructed only when every variant encoded; a partially derived set
/// never leaves this module.
#[derive(Debug)]
pub struct VariantSet {
    pub source_width: u32,
    pub source_height: u32,
    pub small: EncodedVariant,
    pub medium: EncodedVariant,
    pub large: EncodedVariant,
}

/// Derives the fixed resized variant set from a source image.
///
/// This is the CPU-bound stage of the pipeline; callers run it on the
/// blocking pool and bound how many run at once.
pub struct TransformEngine {
    small_edge: u32,
    medium_edge: u32,
    large_edge: u32,
    jpeg_quality: u8,
    max_input_pixels: u64,
}

impl TransformEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            small_edge: config.variant_edges.small,
            medium_edge: config.variant_edges.medium,
            large_edge: config.variant_edges.large,
            jpeg_quality: config.jpeg_quality,
            max_input_pixels: config.max_input_pixels,
        }
    }

    /// Decode the source and derive all configured variants.
    pub fn transform(&self, bytes: &[u8]) -> Result<VariantSet, TransformError> {
        sniff_format(bytes).ok_or(TransformError::UnsupportedFormat)?;

        let (width, height) = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| TransformError::Decode(e.to_string()))?
            .into_dimensions()
            .map_err(|e| TransformError::Decode(e.to_string()))?;

        if u64::from(width) * u64::from(height) > self.max_input_pixels {
            return Err(TransformError::TooManyPixels {
                width,
                height,
                limit: self.max_input_pixels,
            });
        }

        let source = image::load_from_memory(bytes)
            .map_err(|e| TransformError::Decode(e.to_string()))?;

        let small = self.encode_variant(&source, "small", self.small_edge)?;
        let medium = self.encode_variant(&source, "medium", self.medium_edge)?;
        let large = self.encode_variant(&source, "large", self.large_edge)?;

        debug!(
            width = width,
            height = height,
            "Derived variant set from source image"
        );

        Ok(VariantSet {
            source_width: width,
            source_height: height,
            small,
            medium,
            large,
        })
    }

    /// Resize to the given long-edge target (aspect preserved, never
    /// upscaled) and encode as JPEG.
    fn encode_variant(
        &self,
        source: &DynamicImage,
        label: &'static str,
        max_edge: u32,
    ) -> Result<EncodedVariant, TransformError> {
        let (w, h) = source.dimensions();

        let resized = if w.max(h) > max_edge {
            source.resize(max_edge, max_edge, FilterType::Lanczos3)
        } else {
            source.clone()
        };

        // JPEG has no alpha channel
        let rgb = resized.into_rgb8();
        let (width, height) = rgb.dimensions();

        let mut out = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut out, self.jpeg_quality);
        rgb.write_with_encoder(encoder)
            .map_err(|e| TransformError::Encode {
                label,
                message: e.to_string(),
            })?;

        Ok(EncodedVariant {
            label,
            width,
            height,
            bytes: out.into_inner(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariantEdges;
    use image::RgbImage;

    fn test_engine() -> TransformEngine {
        TransformEngine {
            small_edge: 400,
            medium_edge: 800,
            large_edge: 1200,
            jpeg_quality: 85,
            max_input_pixels: 268_402_689,
        }
    }

    fn synth_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut out, 90);
        img.write_with_encoder(encoder).unwrap();
        out.into_inner()
    }

    fn synth_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_sniff_format() {
        assert_eq!(sniff_format(&synth_jpeg(4, 4)), Some(SniffedFormat::Jpeg));
        assert_eq!(sniff_format(&synth_png(4, 4)), Some(SniffedFormat::Png));
        assert_eq!(sniff_format(b"not an image at all"), None);
        assert_eq!(sniff_format(&[]), None);
    }

    #[test]
    fn test_transform_produces_all_variants() {
        let engine = test_engine();
        let set = engine.transform(&synth_jpeg(1600, 1200)).unwrap();

        assert_eq!(set.source_width, 1600);
        assert_eq!(set.source_height, 1200);
        assert_eq!(set.small.width.max(set.small.height), 400);
        assert_eq!(set.medium.width.max(set.medium.height), 800);
        assert_eq!(set.large.width.max(set.large.height), 1200);
        assert!(!set.small.bytes.is_empty());
        assert!(!set.medium.bytes.is_empty());
        assert!(!set.large.bytes.is_empty());
    }

    #[test]
    fn test_transform_preserves_aspect_ratio() {
        let engine = test_engine();
        let set = engine.transform(&synth_jpeg(1600, 800)).unwrap();

        // 2:1 source stays 2:1 at every size
        assert_eq!(set.small.width, 400);
        assert_eq!(set.small.height, 200);
        assert_eq!(set.medium.width, 800);
        assert_eq!(set.medium.height, 400);
    }

    #[test]
    fn test_transform_never_upscales() {
        let engine = test_engine();
        let set = engine.transform(&synth_jpeg(600, 450)).unwrap();

        // medium and large targets exceed the 600px source; keep native size
        assert_eq!(set.medium.width, 600);
        assert_eq!(set.medium.height, 450);
        assert_eq!(set.large.width, 600);
        assert_eq!(set.large.height, 450);
        // small is still downscaled
        assert_eq!(set.small.width, 400);
        assert_eq!(set.small.height, 300);
    }

    #[test]
    fn test_transform_decodes_png_input() {
        let engine = test_engine();
        let set = engine.transform(&synth_png(900, 600)).unwrap();
        assert_eq!(set.large.width, 900);
        assert_eq!(set.small.width, 400);
    }

    #[test]
    fn test_transform_rejects_corrupt_bytes() {
        let engine = test_engine();

        // Valid JPEG magic bytes, garbage body
        let mut corrupt = vec![0xFF, 0xD8, 0xFF];
        corrupt.extend_from_slice(&[0x42; 64]);
        assert!(matches!(
            engine.transform(&corrupt),
            Err(TransformError::Decode(_))
        ));

        // No recognizable signature at all
        assert!(matches!(
            engine.transform(b"plain text"),
            Err(TransformError::UnsupportedFormat)
        ));
    }

    #[test]
    fn test_transform_rejects_oversized_pixel_count() {
        let config = PipelineConfig {
            max_file_size_bytes: 50 * 1024 * 1024,
            max_files_per_batch: 100,
            allowed_mime_types: vec![],
            worker_concurrency: 4,
            variant_edges: VariantEdges::default(),
            jpeg_quality: 85,
            max_input_pixels: 100 * 100,
        };
        let engine = TransformEngine::new(&config);

        assert!(matches!(
            engine.transform(&synth_jpeg(200, 200)),
            Err(TransformError::TooManyPixels { .. })
        ));
    }
}
