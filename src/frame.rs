//! Frames read from the camera and their grayscale derivatives.
//!
//! - `Frame`: one RGB image from the camera plus its capture time. Owned by the
//!   pipeline iteration that read it.
//! - `GrayFrame`: blurred single-channel copy used only for differencing.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};
use std::time::Instant;

/// Quality used when nothing else is configured.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// One image captured from the camera source.
///
/// There is no mutable access to the pixels once the frame exists.
pub struct Frame {
    image: RgbImage,
    captured_at: DateTime<Local>,
    captured_instant: Instant,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self::with_time(image, Local::now(), Instant::now())
    }

    /// Build a frame with explicit timestamps (replayed or scripted sources).
    pub fn with_time(image: RgbImage, captured_at: DateTime<Local>, captured_instant: Instant) -> Self {
        Self {
            image,
            captured_at,
            captured_instant,
        }
    }

    /// Wrap a packed RGB24 buffer.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))?;
        Ok(Self::new(image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    pub fn captured_instant(&self) -> Instant {
        self.captured_instant
    }

    /// Encode the frame as JPEG at `quality` (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        encode_jpeg(&self.image, quality)
    }
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64 * 1024);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode_image(image)
        .map_err(|e| anyhow!("jpeg encode: {}", e))?;
    Ok(out)
}

/// Single-channel blurred frame. Lives for one pipeline iteration, then becomes
/// the baseline for the next one.
#[derive(Clone, Debug)]
pub struct GrayFrame {
    image: GrayImage,
}

impl GrayFrame {
    pub(crate) fn new(image: GrayImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
