//! OCR engine with a configuration-variant cascade
//!
//! Runs the backend once per configured variant (page segmentation mode,
//! engine mode, whitelist on/off), scores every non-empty attempt and keeps
//! the best text.

use crate::capture::RawImage;
use crate::config::{OcrSettings, OcrVariant, ScriptHint};
use crate::error::PipelineError;
use crate::select::best_of;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::tesseract::TesseractBackend;

/// Failure of a single backend invocation
#[derive(Error, Debug)]
pub enum OcrBackendError {
    /// The backend cannot be run at all (missing binary, missing language data)
    #[error("OCR backend unavailable: {0}")]
    Unavailable(String),

    #[error("OCR failed: {0}")]
    Failed(String),

    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),
}

/// What the backend is asked to do for one variant
#[derive(Debug, Clone)]
pub struct OcrRequest {
    pub variant: OcrVariant,
    pub script: ScriptHint,
    /// Allowed glyphs, when the variant restricts output
    pub whitelist: Option<String>,
}

/// Raw backend output
#[derive(Debug, Clone, Default)]
pub struct OcrOutput {
    pub text: String,
    /// Mean word confidence in [0, 100], when the backend reports it
    pub confidence: Option<f32>,
}

/// A text recognizer
pub trait OcrBackend: Send + Sync {
    fn name(&self) -> &str;

    fn recognize(&self, image: &RawImage, request: &OcrRequest) -> Result<OcrOutput, OcrBackendError>;
}

/// One variant's result, reduced to a winner and then dropped
#[derive(Debug, Clone)]
pub struct OcrAttempt {
    pub variant: OcrVariant,
    pub raw_text: String,
    pub confidence: Option<f32>,
    pub quality: f32,
}

/// Runs the variant cascade against one backend
pub struct OcrEngine {
    backend: Arc<dyn OcrBackend>,
    variants: Vec<OcrVariant>,
    max_variants: usize,
}

impl OcrEngine {
    pub fn new(backend: Arc<dyn OcrBackend>, variants: Vec<OcrVariant>, max_variants: usize) -> Self {
        Self {
            backend,
            variants,
            max_variants: max_variants.max(1),
        }
    }

    /// Tesseract CLI with the configured variants
    pub fn from_settings(settings: &OcrSettings) -> Self {
        let backend = TesseractBackend::new(
            &settings.tesseract_cmd,
            &settings.language,
            Duration::from_millis(settings.timeout_ms.max(1)),
        );
        let variants = if settings.variants.is_empty() {
            crate::config::default_variants()
        } else {
            settings.variants.clone()
        };
        Self::new(Arc::new(backend), variants, settings.max_variants)
    }

    pub fn backend(&self) -> &Arc<dyn OcrBackend> {
        &self.backend
    }

    /// Best recognized text, or "" when no variant found any
    pub fn extract(&self, image: &RawImage, script: ScriptHint) -> Result<String, PipelineError> {
        Ok(self
            .extract_best(image, script)?
            .map(|attempt| attempt.raw_text)
            .unwrap_or_default())
    }

    /// Best non-empty attempt with its quality score.
    ///
    /// Fails only when the backend could not be invoked for any variant.
    pub fn extract_best(
        &self,
        image: &RawImage,
        script: ScriptHint,
    ) -> Result<Option<OcrAttempt>, PipelineError> {
        if image.is_empty() {
            return Ok(None);
        }

        let inventory = whitelist(script);
        let mut attempts = Vec::new();
        let mut unavailable = Vec::new();
        let mut invoked = 0usize;

        for variant in self.variants.iter().take(self.max_variants) {
            invoked += 1;
            let request = OcrRequest {
                variant: *variant,
                script,
                whitelist: variant.use_whitelist.then(|| inventory.clone()),
            };

            match self.backend.recognize(image, &request) {
                Ok(output) => {
                    let quality = quality_score(&output.text, output.confidence, script);
                    debug!(
                        "Variant psm={} oem={:?} whitelist={} -> {} chars, quality {:.3}",
                        variant.psm,
                        variant.oem,
                        variant.use_whitelist,
                        output.text.chars().count(),
                        quality
                    );
                    attempts.push(OcrAttempt {
                        variant: *variant,
                        raw_text: output.text,
                        confidence: output.confidence,
                        quality,
                    });
                }
                Err(OcrBackendError::Unavailable(msg)) => {
                    warn!("{} unavailable for psm {}: {}", self.backend.name(), variant.psm, msg);
                    unavailable.push(msg);
                }
                Err(e) => {
                    warn!("{} variant psm {} failed: {}", self.backend.name(), variant.psm, e);
                }
            }
        }

        if invoked > 0 && unavailable.len() == invoked {
            return Err(PipelineError::EngineUnavailable(unavailable.join("; ")));
        }

        let best = best_of(attempts, |a| {
            if a.raw_text.trim().is_empty() {
                None
            } else {
                Some(a.quality)
            }
        });

        match &best {
            Some(b) => info!(
                "OCR picked variant {} (psm {}) with quality {:.3}",
                b.index, b.value.variant.psm, b.score
            ),
            None => info!("OCR found no text in any variant"),
        }

        Ok(best.map(|b| b.value))
    }
}

/// Full glyph inventory for a script, used as the engine whitelist
pub fn whitelist(script: ScriptHint) -> String {
    match script {
        ScriptHint::Latin => (0x21u8..=0x7e).map(char::from).collect(),
        ScriptHint::Japanese => {
            let mut s = String::new();
            s.extend('0'..='9');
            s.extend('A'..='Z');
            s.extend('a'..='z');
            // Hiragana incl. voiced and small forms
            s.extend('\u{3041}'..='\u{3096}');
            // Katakana incl. voiced and small forms, middle dot and prolonged mark
            s.extend('\u{30A1}'..='\u{30FC}');
            s.push_str("。、！？（）「」【】〔〕〈〉《》[]{}()<>\"'・…：；");
            s.push_str("①②③④⑤⑥⑦⑧⑨⑩ⅠⅡⅢⅣⅤⅥⅦⅧⅨⅩ");
            s.push_str("＋－×÷＝≠≤≥＜＞％‰∞√∴∵∈∋∪∩∧∨+-=%/.,");
            s.push('\u{3000}');
            s
        }
    }
}

/// Characters counted as plausible output for the script when scoring
fn is_script_char(c: char, script: ScriptHint) -> bool {
    match script {
        ScriptHint::Latin => c.is_ascii_graphic(),
        ScriptHint::Japanese => {
            c.is_ascii_alphanumeric()
                || ('\u{3000}'..='\u{30FF}').contains(&c)
                || ('\u{4E00}'..='\u{9FFF}').contains(&c)
                || ('\u{FF01}'..='\u{FF5E}').contains(&c)
                || "①②③④⑤⑥⑦⑧⑨⑩ⅠⅡⅢⅣⅤⅥⅦⅧⅨⅩ×÷≠≤≥‰∞√∴∵∈∋∪∩∧∨+-=%/.,()[]{}<>\"'…".contains(c)
        }
    }
}

/// A token that is noise rather than text: one character repeated (`----`,
/// `....`) or a single stray symbol
fn is_garbage_token(token: &str) -> bool {
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let len = token.chars().count();
    if len == 1 {
        return !first.is_alphanumeric();
    }
    len >= 3 && chars.all(|c| c == first) && !first.is_alphanumeric()
}

/// Quality of one OCR attempt in [0, 1].
///
/// Longer text scores higher (saturating), as does a higher share of
/// characters from the script's inventory. Runs of garbage tokens and
/// consecutive repeats of the same token are penalized. When the backend
/// reports a confidence it is blended in.
pub fn quality_score(text: &str, confidence: Option<f32>, script: ScriptHint) -> f32 {
    let glyphs: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if glyphs.is_empty() {
        return 0.0;
    }

    let length = 1.0 - (-(glyphs.len() as f32) / 20.0).exp();
    let in_script = glyphs.iter().filter(|c| is_script_char(**c, script)).count();
    let ratio = in_script as f32 / glyphs.len() as f32;

    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut bad = tokens.iter().filter(|t| is_garbage_token(t)).count();
    bad += tokens
        .windows(3)
        .filter(|w| w[0] == w[1] && w[1] == w[2])
        .count();
    let penalty = (bad as f32 / tokens.len().max(1) as f32).min(1.0);

    let base = (0.4 * length + 0.6 * ratio) * (1.0 - penalty);

    match confidence {
        Some(c) if c.is_finite() => 0.7 * base + 0.3 * (c / 100.0).clamp(0.0, 1.0),
        _ => base,
    }
}
