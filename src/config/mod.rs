//! Application Configuration
//!
//! Pipeline settings stored in TOML format. Every section and field has a
//! default, so a partial file only needs the values it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Screen capture settings
    pub capture: CaptureSettings,
    /// Text region auto-detection settings
    pub detection: DetectionSettings,
    /// Image preprocessing settings
    pub preprocess: PreprocessSettings,
    /// OCR engine settings
    pub ocr: OcrSettings,
    /// Fuzzy matching settings
    pub matching: MatchingSettings,
    /// Question bank sources
    pub bank: BankSettings,
    /// Trigger hotkeys
    pub hotkey: HotkeySettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Static capture rectangle in virtual screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSettings {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 800,
            height: 600,
        }
    }
}

/// Capture-related settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Region captured on every trigger
    pub region: RegionSettings,
    /// Narrow the capture to the detected text area
    pub auto_detect: bool,
    /// Upper bound for a single capture strategy attempt
    pub timeout_ms: u64,
    /// Screenshot tool command line writing the full screen as PNG to
    /// `{output}`. `None` picks a platform default.
    pub tool_command: Option<Vec<String>>,
    /// Persist captured and preprocessed images for debugging
    pub save_debug_images: bool,
    /// Where debug images go (defaults to the data directory)
    pub debug_dir: Option<PathBuf>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            region: RegionSettings::default(),
            auto_detect: true,
            timeout_ms: 3000,
            tool_command: None,
            save_debug_images: false,
            debug_dir: None,
        }
    }
}

/// Text region detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Intensity step used to measure region stability
    pub delta: u8,
    /// Maximum relative area growth across `2 * delta` levels
    pub max_variation: f32,
    /// Regions smaller than this (in pixels) are treated as noise
    pub min_area: u32,
    /// Regions larger than this fraction of the image are background
    pub max_area_ratio: f32,
    /// Padding added around the union of text regions
    pub margin: u32,
    /// Minimum contour box width accepted by the fallback detector
    pub contour_min_width: u32,
    /// Minimum contour box height accepted by the fallback detector
    pub contour_min_height: u32,
    /// Padding added around the fallback contour box
    pub contour_margin: u32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            delta: 5,
            max_variation: 0.5,
            min_area: 30,
            max_area_ratio: 0.25,
            margin: 10,
            contour_min_width: 50,
            contour_min_height: 20,
            contour_margin: 5,
        }
    }
}

/// Denoising filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoiseKind {
    #[default]
    Median,
    Gaussian,
}

/// Binarization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarizationMode {
    /// Local mean threshold, for uneven backgrounds
    #[default]
    Adaptive,
    /// Single histogram-derived threshold, for flat backgrounds
    Otsu,
    /// Keep the enhanced grayscale image
    None,
}

/// Image preprocessing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// Master switch; when off the capture goes to OCR untouched
    pub enabled: bool,
    /// Convert to grayscale
    pub grayscale: bool,
    /// Upscale factor (values below 1.0 are treated as 1.0)
    pub scale: f32,
    /// Denoising filter kind
    pub denoise: DenoiseKind,
    /// Denoising radius, 0 disables
    pub denoise_radius: u32,
    /// Run contrast stretch and unsharp mask before binarization
    pub enhance: bool,
    /// Fraction of pixels clipped at each end of the histogram when stretching
    pub contrast_clip: f32,
    /// Unsharp mask blur sigma
    pub sharpen_sigma: f32,
    /// Unsharp mask strength, 0 disables
    pub sharpen_amount: f32,
    /// Binarization strategy
    pub binarization: BinarizationMode,
    /// Neighbourhood radius for adaptive thresholding
    pub adaptive_block_radius: u32,
    /// Offset subtracted from the local mean for adaptive thresholding
    pub adaptive_offset: i32,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            grayscale: true,
            scale: 2.0,
            denoise: DenoiseKind::Median,
            denoise_radius: 1,
            enhance: true,
            contrast_clip: 0.01,
            sharpen_sigma: 1.0,
            sharpen_amount: 1.5,
            binarization: BinarizationMode::Adaptive,
            adaptive_block_radius: 5,
            adaptive_offset: 2,
        }
    }
}

/// Script the OCR engine should expect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptHint {
    #[default]
    Japanese,
    Latin,
}

/// One OCR configuration interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrVariant {
    /// Page segmentation mode
    pub psm: u8,
    /// Recognition engine mode, `None` leaves the engine default
    #[serde(default)]
    pub oem: Option<u8>,
    /// Restrict output to the script's glyph inventory
    #[serde(default)]
    pub use_whitelist: bool,
}

/// The default variant cascade: block/neural, word/neural, bare block, line/legacy
pub fn default_variants() -> Vec<OcrVariant> {
    vec![
        OcrVariant { psm: 6, oem: Some(3), use_whitelist: true },
        OcrVariant { psm: 8, oem: Some(3), use_whitelist: true },
        OcrVariant { psm: 6, oem: None, use_whitelist: false },
        OcrVariant { psm: 7, oem: Some(1), use_whitelist: true },
    ]
}

/// OCR engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Tesseract executable
    pub tesseract_cmd: String,
    /// Tesseract language code(s), e.g. "jpn" or "jpn+eng"
    pub language: String,
    /// Script of the expected text (drives the whitelist)
    pub script: ScriptHint,
    /// Variants tried in order
    pub variants: Vec<OcrVariant>,
    /// Maximum number of variants tried per recognition
    pub max_variants: usize,
    /// Upper bound for one Tesseract invocation
    pub timeout_ms: u64,
    /// Also recognize the minimally processed image and keep the better text
    pub try_unprocessed: bool,
    /// Recognized text shorter than this is treated as empty
    pub min_text_chars: usize,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            tesseract_cmd: "tesseract".to_string(),
            language: "jpn".to_string(),
            script: ScriptHint::Japanese,
            variants: default_variants(),
            max_variants: 4,
            timeout_ms: 10_000,
            try_unprocessed: false,
            min_text_chars: 3,
        }
    }
}

/// Fuzzy matching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    /// Minimum similarity (0.0 - 1.0) for a confident match
    pub threshold: f64,
    /// Number of candidates kept in the rank list
    pub top_k: usize,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            top_k: 3,
        }
    }
}

/// Question bank file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Csv,
    Json,
}

/// One question bank partition and its column mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankSourceConfig {
    /// Partition identifier (sheet name)
    pub id: String,
    /// File to read
    pub path: PathBuf,
    /// Format, inferred from the extension when omitted
    #[serde(default)]
    pub format: Option<SourceFormat>,
    /// Higher priority wins score ties
    #[serde(default)]
    pub priority: i32,
    /// Column holding the question text
    pub question_column: String,
    /// Columns holding the options, in label order
    pub option_columns: Vec<String>,
    /// Labels for the option columns (defaults to A, B, C, ...)
    #[serde(default)]
    pub option_labels: Option<Vec<String>>,
    /// Column holding the correct answer label
    pub answer_column: String,
}

/// Question bank settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BankSettings {
    pub sources: Vec<BankSourceConfig>,
}

/// Hotkey settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeySettings {
    /// Starts a pipeline run
    pub trigger: String,
    /// Stops the hotkey loop
    pub exit: Option<String>,
    /// Reloads the question bank
    pub reload: Option<String>,
    /// Prints runtime statistics
    pub stats: Option<String>,
    /// Trigger presses closer together than this are ignored
    pub debounce_ms: u64,
}

impl Default for HotkeySettings {
    fn default() -> Self {
        Self {
            trigger: "F12".to_string(),
            exit: Some("F11".to_string()),
            reload: Some("Ctrl+Shift+R".to_string()),
            stats: Some("Ctrl+Shift+S".to_string()),
            debounce_ms: 1000,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert_eq!(config.capture.region, RegionSettings { x: 0, y: 0, width: 800, height: 600 });
        assert!(config.capture.auto_detect);
        assert!(!config.capture.save_debug_images);

        assert!(config.preprocess.enabled);
        assert!((config.preprocess.scale - 2.0).abs() < 0.01);
        assert_eq!(config.preprocess.binarization, BinarizationMode::Adaptive);

        assert_eq!(config.ocr.language, "jpn");
        assert_eq!(config.ocr.variants.len(), 4);
        assert_eq!(config.ocr.variants[0].psm, 6);

        assert!((config.matching.threshold - 0.8).abs() < 1e-9);
        assert_eq!(config.matching.top_k, 3);
        assert!(config.bank.sources.is_empty());

        assert_eq!(config.hotkey.trigger, "F12");
        assert_eq!(config.hotkey.reload.as_deref(), Some("Ctrl+Shift+R"));
        assert_eq!(config.hotkey.debounce_ms, 1000);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.bank.sources.push(BankSourceConfig {
            id: "math".to_string(),
            path: PathBuf::from("math.csv"),
            format: None,
            priority: 2,
            question_column: "question".to_string(),
            option_columns: vec!["a".to_string(), "b".to_string()],
            option_labels: None,
            answer_column: "answer".to_string(),
        });

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.bank.sources.len(), 1);
        assert_eq!(parsed.bank.sources[0].priority, 2);
        assert_eq!(parsed.ocr.variants, config.ocr.variants);
        assert_eq!(parsed.capture.region, config.capture.region);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [matching]
            threshold = 0.6

            [preprocess]
            binarization = "otsu"
        "#;
        let parsed: AppConfig = toml::from_str(toml_str).unwrap();

        assert!((parsed.matching.threshold - 0.6).abs() < 1e-9);
        assert_eq!(parsed.matching.top_k, 3);
        assert_eq!(parsed.preprocess.binarization, BinarizationMode::Otsu);
        assert_eq!(parsed.preprocess.denoise_radius, 1);
        assert_eq!(parsed.ocr.tesseract_cmd, "tesseract");
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.capture.timeout_ms, loaded.capture.timeout_ms);
        assert_eq!(config.ocr.max_variants, loaded.ocr.max_variants);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
