//! Resize and re-encode fetched images

use crate::config::{OptimizerConfig, PngCompression};
use crate::error::{ImageCacheError, Result};
use crate::models::{ImageVariant, OutputFormat};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{self, PngEncoder};
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{debug, warn};

/// Result of an optimization pass
#[derive(Debug, Clone)]
pub struct OptimizedImage {
    pub data: Bytes,
    pub content_type: String,
    /// False when the original bytes were passed through unchanged
    pub optimized: bool,
}

/// Optimizer shrinks images into their variant box and re-encodes them
///
/// All work is CPU bound and synchronous; async callers should run it through
/// `tokio::task::spawn_blocking`.
#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Optimizer { config }
    }

    pub fn preferred_format(&self) -> OutputFormat {
        self.config.preferred_format
    }

    /// Optimize into the configured output format
    pub fn optimize(
        &self,
        data: Bytes,
        variant: ImageVariant,
        source_content_type: &str,
    ) -> OptimizedImage {
        self.optimize_to(data, variant, source_content_type, self.config.preferred_format)
    }

    /// Optimize into `format`
    ///
    /// Never fails: on any decode or encode error the input is returned as-is
    /// with `optimized == false`.
    pub fn optimize_to(
        &self,
        data: Bytes,
        variant: ImageVariant,
        source_content_type: &str,
        format: OutputFormat,
    ) -> OptimizedImage {
        if !self.config.enabled {
            return passthrough(data, source_content_type);
        }

        match self.transcode(&data, variant, format) {
            Ok(encoded) => {
                debug!(
                    "Optimized {} -> {} for variant={}: {} -> {} bytes",
                    source_content_type,
                    format.content_type(),
                    variant,
                    data.len(),
                    encoded.len()
                );
                OptimizedImage {
                    data: Bytes::from(encoded),
                    content_type: format.content_type().to_string(),
                    optimized: true,
                }
            }
            Err(e) => {
                warn!(
                    "Optimization failed for variant={}, keeping original: {}",
                    variant, e
                );
                passthrough(data, source_content_type)
            }
        }
    }

    fn transcode(&self, data: &[u8], variant: ImageVariant, format: OutputFormat) -> Result<Vec<u8>> {
        let img = image::load_from_memory(data)
            .map_err(|e| ImageCacheError::ProcessingError(format!("decode failed: {}", e)))?;
        let img = fit_inside(img, variant.dimension());

        match format {
            OutputFormat::WebP => self.encode_webp(&img),
            OutputFormat::Jpeg => self.encode_jpeg(&img),
            OutputFormat::Png => self.encode_png(&img),
        }
    }

    fn encode_webp(&self, img: &DynamicImage) -> Result<Vec<u8>> {
        // The libwebp encoder only takes 8-bit RGB or RGBA buffers
        let img = if img.color().has_alpha() {
            DynamicImage::ImageRgba8(img.to_rgba8())
        } else {
            DynamicImage::ImageRgb8(img.to_rgb8())
        };
        let encoder = webp::Encoder::from_image(&img)
            .map_err(|e| ImageCacheError::ProcessingError(format!("webp encoder: {}", e)))?;
        Ok(encoder.encode(self.config.webp_quality).to_vec())
    }

    fn encode_jpeg(&self, img: &DynamicImage) -> Result<Vec<u8>> {
        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, self.config.jpeg_quality);
        rgb.write_with_encoder(encoder)
            .map_err(|e| ImageCacheError::ProcessingError(format!("jpeg encode: {}", e)))?;
        Ok(out)
    }

    fn encode_png(&self, img: &DynamicImage) -> Result<Vec<u8>> {
        let compression = match self.config.png_compression {
            PngCompression::Fast => png::CompressionType::Fast,
            PngCompression::Default => png::CompressionType::Default,
            PngCompression::Best => png::CompressionType::Best,
        };
        let mut out = Vec::new();
        let encoder =
            PngEncoder::new_with_quality(&mut out, compression, png::FilterType::Adaptive);
        img.write_with_encoder(encoder)
            .map_err(|e| ImageCacheError::ProcessingError(format!("png encode: {}", e)))?;
        Ok(out)
    }
}

/// Shrink `img` to fit a `max` x `max` box; smaller images are left alone
fn fit_inside(img: DynamicImage, max: u32) -> DynamicImage {
    if img.width() <= max && img.height() <= max {
        return img;
    }
    img.resize(max, max, FilterType::Lanczos3)
}

fn passthrough(data: Bytes, content_type: &str) -> OptimizedImage {
    OptimizedImage {
        data,
        content_type: content_type.to_string(),
        optimized: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Bytes {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    fn decoded_dimensions(data: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(data).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn test_downscale_preserves_aspect_ratio() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let out = optimizer.optimize_to(
            png_bytes(1000, 500),
            ImageVariant::Small,
            "image/png",
            OutputFormat::Png,
        );
        assert!(out.optimized);
        assert_eq!(out.content_type, "image/png");
        assert_eq!(decoded_dimensions(&out.data), (300, 150));
    }

    #[test]
    fn test_never_enlarges() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let out = optimizer.optimize_to(
            png_bytes(40, 60),
            ImageVariant::Large,
            "image/png",
            OutputFormat::Jpeg,
        );
        assert!(out.optimized);
        assert_eq!(out.content_type, "image/jpeg");
        assert_eq!(decoded_dimensions(&out.data), (40, 60));
    }

    #[test]
    fn test_webp_default_output() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let out = optimizer.optimize(png_bytes(200, 200), ImageVariant::Tiny, "image/png");
        assert!(out.optimized);
        assert_eq!(out.content_type, "image/webp");
        assert_eq!(&out.data[0..4], b"RIFF");
        assert_eq!(&out.data[8..12], b"WEBP");
    }

    #[test]
    fn test_undecodable_input_passes_through() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let garbage = Bytes::from(vec![0xAB; 500]);
        let out = optimizer.optimize(garbage.clone(), ImageVariant::Small, "image/jpeg");
        assert!(!out.optimized);
        assert_eq!(out.data, garbage);
        assert_eq!(out.content_type, "image/jpeg");
    }

    #[test]
    fn test_disabled_passes_through() {
        let config = OptimizerConfig {
            enabled: false,
            ..OptimizerConfig::default()
        };
        let input = png_bytes(900, 900);
        let out = Optimizer::new(config).optimize(input.clone(), ImageVariant::Small, "image/png");
        assert!(!out.optimized);
        assert_eq!(out.data, input);
    }
}
