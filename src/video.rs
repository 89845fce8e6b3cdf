//! Still-frame encoding for the video input.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageError};

/// Turns a frame into the bytes carried by a video message
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, frame: &DynamicImage) -> Result<Vec<u8>, ImageError>;
}

/// JPEG encoding with a fixed quality
#[derive(Debug, Clone, Copy)]
pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    /// Quality is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegFrameEncoder {
    fn default() -> Self {
        Self::new(75)
    }
}

impl ImageEncoder for JpegFrameEncoder {
    fn encode(&self, frame: &DynamicImage) -> Result<Vec<u8>, ImageError> {
        // JPEG has no alpha channel
        let rgb = frame.to_rgb8();
        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.quality);
        encoder.encode_image(&rgb)?;
        Ok(jpeg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn test_encodes_rgba_frame_as_jpeg() {
        let frame = DynamicImage::ImageRgba8(RgbaImage::from_pixel(32, 24, Rgba([200, 40, 40, 128])));
        let jpeg = JpegFrameEncoder::default().encode(&frame).unwrap();

        // SOI and EOI markers
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn test_quality_is_clamped() {
        assert_eq!(JpegFrameEncoder::new(0).quality(), 1);
        assert_eq!(JpegFrameEncoder::new(255).quality(), 100);
    }
}
