//! Pixel buffers passed between pipeline stages

use super::CaptureRegion;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage, RgbaImage};
use std::path::Path;
use std::time::Instant;

/// Owned pixel data for one captured or processed image
#[derive(Debug, Clone)]
pub struct RawImage {
    /// Interleaved pixel bytes, row-major
    pub data: Vec<u8>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// 1 = gray, 3 = RGB, 4 = RGBA
    pub channels: u8,
    /// When the pixels were grabbed
    pub timestamp: Instant,
}

impl RawImage {
    /// Create an image from raw bytes
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Self {
        Self {
            data,
            width,
            height,
            channels,
            timestamp: Instant::now(),
        }
    }

    pub fn from_gray(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, 1)
    }

    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, 4)
    }

    /// Convert any decoded image, keeping gray images single-channel
    pub fn from_dynamic(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageLuma8(gray) => Self::from_gray(gray),
            DynamicImage::ImageRgb8(rgb) => {
                let (width, height) = rgb.dimensions();
                Self::new(rgb.into_raw(), width, height, 3)
            }
            other => Self::from_rgba(other.to_rgba8()),
        }
    }

    /// Load an image file
    pub fn open(path: &Path) -> Result<Self, image::ImageError> {
        Ok(Self::from_dynamic(image::open(path)?))
    }

    /// Get image dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// True when there are no pixels to look at
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    fn has_consistent_len(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * self.channels as usize
    }

    /// View as an `image` crate buffer, `None` if the byte count doesn't fit
    pub fn to_dynamic(&self) -> Option<DynamicImage> {
        if !self.has_consistent_len() {
            return None;
        }
        let data = self.data.clone();
        match self.channels {
            1 => GrayImage::from_raw(self.width, self.height, data).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(self.width, self.height, data).map(DynamicImage::ImageRgb8),
            4 => RgbaImage::from_raw(self.width, self.height, data).map(DynamicImage::ImageRgba8),
            _ => None,
        }
    }

    /// Grayscale copy using luminance weights 0.299 R + 0.587 G + 0.114 B
    pub fn to_gray(&self) -> Option<GrayImage> {
        if !self.has_consistent_len() {
            return None;
        }
        let channels = self.channels as usize;
        let width = self.width as usize;

        match channels {
            1 => GrayImage::from_raw(self.width, self.height, self.data.clone()),
            3 | 4 => Some(ImageBuffer::from_fn(self.width, self.height, |x, y| {
                let idx = (y as usize * width + x as usize) * channels;
                let r = self.data[idx] as f32;
                let g = self.data[idx + 1] as f32;
                let b = self.data[idx + 2] as f32;
                let luma = 0.299 * r + 0.587 * g + 0.114 * b;
                Luma([luma.round().clamp(0.0, 255.0) as u8])
            })),
            _ => None,
        }
    }

    /// Copy out a sub-rectangle given in image coordinates, clamped to the image
    pub fn crop(&self, region: &CaptureRegion) -> RawImage {
        let bounds = CaptureRegion::new(0, 0, self.width.max(1), self.height.max(1));
        let r = region.clamp_to(&bounds);
        let channels = self.channels as usize;

        if self.is_empty() || !self.has_consistent_len() {
            return self.clone();
        }

        let mut data = Vec::with_capacity(r.width as usize * r.height as usize * channels);
        let row_len = self.width as usize * channels;
        for y in r.y as usize..(r.y as usize + r.height as usize) {
            let start = y * row_len + r.x as usize * channels;
            let end = start + r.width as usize * channels;
            data.extend_from_slice(&self.data[start..end]);
        }

        RawImage {
            data,
            width: r.width,
            height: r.height,
            channels: self.channels,
            timestamp: self.timestamp,
        }
    }

    /// Resize to exact dimensions (used when a backend returns HiDPI pixels)
    pub fn resized(&self, width: u32, height: u32) -> RawImage {
        let Some(img) = self.to_dynamic() else {
            return self.clone();
        };
        let scaled = img.resize_exact(width, height, image::imageops::FilterType::Triangle);
        let mut out = RawImage::from_dynamic(scaled);
        out.timestamp = self.timestamp;
        out
    }

    /// Write as PNG
    pub fn save_png(&self, path: &Path) -> Result<(), image::ImageError> {
        match self.to_dynamic() {
            Some(img) => img.save_with_format(path, image::ImageFormat::Png),
            None => Err(image::ImageError::Parameter(
                image::error::ParameterError::from_kind(
                    image::error::ParameterErrorKind::DimensionMismatch,
                ),
            )),
        }
    }
}
