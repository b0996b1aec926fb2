//! Output image encoding

use std::fmt;
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{MosaicError, Result};

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Lossless WebP, the tile format
    #[default]
    Webp,
    Jpeg,
    Png,
}

impl ImageFormat {
    #[must_use]
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Webp => "image/webp",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Webp => "webp",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "webp" => Ok(ImageFormat::Webp),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            other => Err(MosaicError::Config(format!("unsupported image format: {other}"))),
        }
    }
}

/// Encode an RGB image
pub fn encode(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let (width, height) = image.dimensions();
    match format {
        ImageFormat::Webp => WebPEncoder::new_lossless(&mut buffer).write_image(
            image.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?,
        ImageFormat::Jpeg => JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY).write_image(
            image.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?,
        ImageFormat::Png => PngEncoder::new(&mut buffer).write_image(
            image.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?,
    }
    Ok(buffer)
}

/// [`encode`] on the blocking pool
pub async fn encode_blocking(image: RgbImage, format: ImageFormat) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode(&image, format)).await?
}
