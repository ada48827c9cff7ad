//! Image preprocessing for OCR
//!
//! Grayscale, upscale, denoise, enhance and binarize a capture. Every stage
//! returns a new buffer. When the configured path cannot run (bad parameters,
//! degenerate input) the minimal path is used instead, so preprocessing never
//! fails.

use crate::capture::RawImage;
use crate::config::{BinarizationMode, DenoiseKind, PreprocessSettings};
use image::imageops::FilterType;
use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use thiserror::Error;
use tracing::{debug, warn};

/// Contrast factor of the minimal path
const MINIMAL_CONTRAST: f32 = 1.5;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("invalid preprocessing parameters: {0}")]
    InvalidParameters(String),

    #[error("image cannot be preprocessed: {0}")]
    Degenerate(String),
}

pub type Result<T> = std::result::Result<T, PreprocessError>;

/// Configurable preprocessing chain
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    settings: PreprocessSettings,
}

impl ImagePreprocessor {
    pub fn new(settings: PreprocessSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PreprocessSettings {
        &self.settings
    }

    /// Run the configured chain, degrading to the minimal path on error
    pub fn preprocess(&self, image: &RawImage) -> RawImage {
        if !self.settings.enabled {
            debug!("Preprocessing disabled");
            return image.clone();
        }

        match self.enhanced(image) {
            Ok(out) => out,
            Err(e) => {
                warn!("Preprocessing failed, using minimal path: {}", e);
                self.minimal(image)
            }
        }
    }

    /// The full configured chain
    pub fn enhanced(&self, image: &RawImage) -> Result<RawImage> {
        let s = &self.settings;
        self.validate(image)?;

        let scale = s.scale.max(1.0);
        let needs_luma = s.grayscale
            || s.denoise_radius > 0
            || s.enhance
            || s.binarization != BinarizationMode::None;

        if !needs_luma {
            // Nothing but a resize was asked for; keep the colour channels
            let (w, h) = scaled_dims(image.width, image.height, scale);
            if (w, h) == image.dimensions() {
                return Ok(image.clone());
            }
            let img = image
                .to_dynamic()
                .ok_or_else(|| PreprocessError::Degenerate("unsupported pixel layout".into()))?;
            return Ok(RawImage::from_dynamic(img.resize_exact(w, h, FilterType::CatmullRom)));
        }

        let mut gray = image
            .to_gray()
            .ok_or_else(|| PreprocessError::Degenerate("unsupported pixel layout".into()))?;

        let (w, h) = scaled_dims(gray.width(), gray.height(), scale);
        if (w, h) != gray.dimensions() {
            gray = image::imageops::resize(&gray, w, h, FilterType::CatmullRom);
        }

        if s.denoise_radius > 0 {
            gray = denoise(&gray, s.denoise, s.denoise_radius);
        }

        if s.enhance {
            gray = stretch_contrast(&gray, s.contrast_clip);
            if s.sharpen_amount > 0.0 {
                gray = unsharp_mask(&gray, s.sharpen_sigma, s.sharpen_amount);
            }
        }

        gray = match s.binarization {
            BinarizationMode::Adaptive => {
                ensure_dark_text(adaptive_threshold(&gray, s.adaptive_block_radius, s.adaptive_offset))
            }
            BinarizationMode::Otsu => ensure_dark_text(otsu_binarize(&gray)),
            BinarizationMode::None => gray,
        };

        debug!(
            "Preprocessed {}x{} -> {}x{} ({:?})",
            image.width,
            image.height,
            gray.width(),
            gray.height(),
            s.binarization
        );

        let mut out = RawImage::from_gray(gray);
        out.timestamp = image.timestamp;
        Ok(out)
    }

    /// Grayscale, Lanczos3 resize and a fixed contrast boost.
    ///
    /// Used when the configured chain fails, and as the second candidate for
    /// recognition path selection.
    pub fn minimal(&self, image: &RawImage) -> RawImage {
        let Some(gray) = image.to_gray() else {
            return image.clone();
        };
        if image.is_empty() {
            return image.clone();
        }

        let scale = if self.settings.scale.is_finite() {
            self.settings.scale.clamp(1.0, 8.0)
        } else {
            1.0
        };
        let (w, h) = scaled_dims(gray.width(), gray.height(), scale);
        let mut gray = if (w, h) != gray.dimensions() {
            image::imageops::resize(&gray, w, h, FilterType::Lanczos3)
        } else {
            gray
        };

        apply_contrast(&mut gray, MINIMAL_CONTRAST);

        let mut out = RawImage::from_gray(gray);
        out.timestamp = image.timestamp;
        out
    }

    fn validate(&self, image: &RawImage) -> Result<()> {
        let s = &self.settings;

        if image.is_empty() {
            return Err(PreprocessError::Degenerate("empty image".into()));
        }
        if !s.scale.is_finite() || s.scale <= 0.0 || s.scale > 8.0 {
            return Err(PreprocessError::InvalidParameters(format!("scale {}", s.scale)));
        }
        if !(0.0..0.5).contains(&s.contrast_clip) {
            return Err(PreprocessError::InvalidParameters(format!(
                "contrast_clip {} outside [0, 0.5)",
                s.contrast_clip
            )));
        }
        if s.enhance && s.sharpen_amount > 0.0 && !(s.sharpen_sigma > 0.0) {
            return Err(PreprocessError::InvalidParameters(format!(
                "sharpen_sigma {} must be positive",
                s.sharpen_sigma
            )));
        }
        if s.binarization == BinarizationMode::Adaptive && s.adaptive_block_radius == 0 {
            return Err(PreprocessError::InvalidParameters(
                "adaptive_block_radius must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn scaled_dims(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let w = ((width as f32) * scale).round().max(1.0) as u32;
    let h = ((height as f32) * scale).round().max(1.0) as u32;
    (w, h)
}

fn denoise(image: &GrayImage, kind: DenoiseKind, radius: u32) -> GrayImage {
    match kind {
        DenoiseKind::Median => median_filter(image, radius, radius),
        DenoiseKind::Gaussian => gaussian_blur_f32(image, radius as f32 * 0.5 + 0.5),
    }
}

/// Linear stretch mapping the `clip` and `1 - clip` percentiles to 0 and 255
fn stretch_contrast(image: &GrayImage, clip: f32) -> GrayImage {
    let mut histogram = [0u64; 256];
    for p in image.pixels() {
        histogram[p[0] as usize] += 1;
    }

    let total = image.width() as u64 * image.height() as u64;
    let low_count = (total as f64 * clip as f64).floor() as u64;
    let high_count = (total as f64 * (1.0 - clip as f64)).ceil() as u64;

    let mut cumulative = 0u64;
    let mut low = 0u8;
    let mut high = 255u8;
    let mut low_found = false;
    for (v, &count) in histogram.iter().enumerate() {
        cumulative += count;
        if !low_found && cumulative > low_count {
            low = v as u8;
            low_found = true;
        }
        if cumulative >= high_count {
            high = v as u8;
            break;
        }
    }

    if high <= low {
        return image.clone();
    }

    let range = (high - low) as f32;
    let mut out = image.clone();
    for p in out.pixels_mut() {
        let v = (p[0].saturating_sub(low)) as f32 * 255.0 / range;
        p[0] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// original + amount * (original - blurred)
fn unsharp_mask(image: &GrayImage, sigma: f32, amount: f32) -> GrayImage {
    let blurred = gaussian_blur_f32(image, sigma);
    let mut out = image.clone();
    for (p, b) in out.pixels_mut().zip(blurred.pixels()) {
        let original = p[0] as f32;
        let sharpened = original + amount * (original - b[0] as f32);
        p[0] = sharpened.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Contrast around the midpoint; factor > 1.0 increases contrast
fn apply_contrast(image: &mut GrayImage, factor: f32) {
    for p in image.pixels_mut() {
        let adjusted = ((p[0] as f32 - 128.0) * factor + 128.0).clamp(0.0, 255.0);
        p[0] = adjusted as u8;
    }
}

/// Global threshold at the Otsu level; pixels above it become white
pub fn otsu_binarize(image: &GrayImage) -> GrayImage {
    let level = otsu_level(image);
    threshold(image, level)
}

/// Pixels strictly above `level` become 255, the rest 0
pub fn threshold(image: &GrayImage, level: u8) -> GrayImage {
    let mut out = image.clone();
    for p in out.pixels_mut() {
        p[0] = if p[0] > level { 255 } else { 0 };
    }
    out
}

/// Local mean threshold over a (2r+1)^2 window using a summed-area table.
///
/// A pixel is white when it is brighter than the local mean minus `offset`.
pub fn adaptive_threshold(image: &GrayImage, radius: u32, offset: i32) -> GrayImage {
    let (width, height) = image.dimensions();
    let w = width as usize;
    let h = height as usize;

    let mut integral = vec![0u64; (w + 1) * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += image.get_pixel(x as u32, y as u32)[0] as u64;
            integral[(y + 1) * (w + 1) + x + 1] = integral[y * (w + 1) + x + 1] + row_sum;
        }
    }

    let r = radius as usize;
    let mut out = GrayImage::new(width, height);
    for y in 0..h {
        let y1 = y.saturating_sub(r);
        let y2 = (y + r + 1).min(h);
        for x in 0..w {
            let x1 = x.saturating_sub(r);
            let x2 = (x + r + 1).min(w);

            let sum = integral[y2 * (w + 1) + x2] + integral[y1 * (w + 1) + x1]
                - integral[y1 * (w + 1) + x2]
                - integral[y2 * (w + 1) + x1];
            let area = ((x2 - x1) * (y2 - y1)) as f64;
            let mean = sum as f64 / area;

            let pixel = image.get_pixel(x as u32, y as u32)[0] as f64;
            let value = if pixel > mean - offset as f64 { 255 } else { 0 };
            out.put_pixel(x as u32, y as u32, Luma([value]));
        }
    }
    out
}

/// Invert a binary image whose majority is black, so text ends up dark on light
fn ensure_dark_text(mut image: GrayImage) -> GrayImage {
    let total = image.width() as u64 * image.height() as u64;
    let dark = image.pixels().filter(|p| p[0] < 128).count() as u64;
    if dark * 2 > total {
        for p in image.pixels_mut() {
            p[0] = 255 - p[0];
        }
    }
    image
}
