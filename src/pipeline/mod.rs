//! Perception-to-answer pipeline
//!
//! One run per trigger: capture the configured region, narrow it to the text
//! area, clean the image up, recognize, normalize and match against the
//! current question index snapshot. Every run ends in an [`Outcome`]; stage
//! failures with no fallback end the run as `Unresolved`, never the process.

use crate::bank::{FuzzyMatcher, MatchCandidate, QuestionIndex};
use crate::capture::{CaptureRegion, RawImage, RegionCapture};
use crate::config::{AppConfig, ScriptHint};
use crate::error::PipelineError;
use crate::select::best_of;
use crate::shared::IndexHandle;
use crate::storage::DebugImageSink;
use crate::text::normalize;
use crate::vision::{ImagePreprocessor, OcrEngine, RegionDetector};
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Idle,
    Capturing,
    Detecting,
    Preprocessing,
    Recognizing,
    Normalizing,
    Matching,
    Resolved,
    Unresolved,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Capturing => "capturing",
            PipelineStage::Detecting => "detecting",
            PipelineStage::Preprocessing => "preprocessing",
            PipelineStage::Recognizing => "recognizing",
            PipelineStage::Normalizing => "normalizing",
            PipelineStage::Matching => "matching",
            PipelineStage::Resolved => "resolved",
            PipelineStage::Unresolved => "unresolved",
        };
        f.write_str(name)
    }
}

/// A bank answer for the recognized question
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAnswer {
    /// Question as written in the bank
    pub question_text: String,
    pub matched_answer_label: String,
    pub matched_answer_text: String,
    pub score: f64,
    pub source_id: String,
}

/// Why a run ended without a bank answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    CaptureUnavailable,
    EmptyCapture,
    EngineUnavailable,
    NoText,
    NoMatch,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnresolvedReason::CaptureUnavailable => "screen capture unavailable",
            UnresolvedReason::EmptyCapture => "captured image is empty",
            UnresolvedReason::EngineUnavailable => "OCR engine unavailable",
            UnresolvedReason::NoText => "no text recognized",
            UnresolvedReason::NoMatch => "no confident match in the question bank",
        };
        f.write_str(text)
    }
}

/// Terminal state of one run
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Resolved(ResolvedAnswer),
    Unresolved {
        /// Normalized recognized text; empty when nothing usable was read
        normalized_text: String,
        reason: UnresolvedReason,
        /// Best bank candidates below the threshold
        closest: Vec<MatchCandidate>,
    },
}

impl Outcome {
    fn unresolved(reason: UnresolvedReason) -> Self {
        Outcome::Unresolved {
            normalized_text: String::new(),
            reason,
            closest: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved(_))
    }

    pub fn stage(&self) -> PipelineStage {
        match self {
            Outcome::Resolved(_) => PipelineStage::Resolved,
            Outcome::Unresolved { .. } => PipelineStage::Unresolved,
        }
    }

    /// Question text to hand to the generative fallback, if any
    pub fn fallback_question(&self) -> Option<&str> {
        match self {
            Outcome::Unresolved {
                normalized_text, ..
            } if !normalized_text.is_empty() => Some(normalized_text),
            _ => None,
        }
    }
}

/// The stages of a run, wired from configuration
pub struct Pipeline {
    capture: RegionCapture,
    region: CaptureRegion,
    auto_detect: bool,
    detector: RegionDetector,
    preprocessor: ImagePreprocessor,
    ocr: OcrEngine,
    script: ScriptHint,
    try_unprocessed: bool,
    min_text_chars: usize,
    matcher: FuzzyMatcher,
    index: IndexHandle,
    debug_sink: Option<DebugImageSink>,
}

impl Pipeline {
    /// Build with explicit capture and OCR strategies
    pub fn new(config: &AppConfig, capture: RegionCapture, ocr: OcrEngine, index: IndexHandle) -> Self {
        Self {
            capture,
            region: CaptureRegion::from(config.capture.region),
            auto_detect: config.capture.auto_detect,
            detector: RegionDetector::new(config.detection.clone()),
            preprocessor: ImagePreprocessor::new(config.preprocess.clone()),
            ocr,
            script: config.ocr.script,
            try_unprocessed: config.ocr.try_unprocessed,
            min_text_chars: config.ocr.min_text_chars,
            matcher: FuzzyMatcher::from_settings(&config.matching),
            index,
            debug_sink: None,
        }
    }

    /// Build with the platform capture chain and the Tesseract backend
    pub fn from_config(config: &AppConfig, index: IndexHandle) -> Self {
        let debug_sink = if config.capture.save_debug_images {
            match DebugImageSink::resolve(config.capture.debug_dir.as_deref()) {
                Ok(sink) => {
                    info!("Saving debug images to {:?}", sink.dir());
                    Some(sink)
                }
                Err(e) => {
                    warn!("Debug images disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self::new(
            config,
            RegionCapture::from_settings(&config.capture),
            OcrEngine::from_settings(&config.ocr),
            index,
        )
        .with_debug_sink(debug_sink)
    }

    pub fn with_debug_sink(mut self, sink: Option<DebugImageSink>) -> Self {
        self.debug_sink = sink;
        self
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    pub fn ocr(&self) -> &OcrEngine {
        &self.ocr
    }

    pub fn capture(&self) -> &RegionCapture {
        &self.capture
    }

    pub fn region(&self) -> CaptureRegion {
        self.region
    }

    /// Full run starting from a screen capture
    pub fn run(&self, mut on_stage: impl FnMut(PipelineStage)) -> Outcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", id = %run_id);
        let _enter = span.enter();

        on_stage(PipelineStage::Capturing);
        let started = Instant::now();
        let image = match self.capture.capture(&self.region) {
            Ok(image) => image,
            Err(e) => return self.fail(e, UnresolvedReason::CaptureUnavailable, &mut on_stage),
        };
        debug!("Captured {} in {:?}", self.region, started.elapsed());

        self.process(run_id, image, &mut on_stage)
    }

    /// Run on an already captured image, starting at detection
    pub fn run_on_image(&self, image: RawImage, mut on_stage: impl FnMut(PipelineStage)) -> Outcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", id = %run_id);
        let _enter = span.enter();

        self.process(run_id, image, &mut on_stage)
    }

    /// Normalize and match text that did not come from OCR
    pub fn resolve_text(&self, raw: &str) -> Outcome {
        self.finish(raw, &mut |_: PipelineStage| {})
    }

    fn process(&self, run_id: Uuid, image: RawImage, on_stage: &mut dyn FnMut(PipelineStage)) -> Outcome {
        if image.is_empty() {
            warn!("Captured image is empty");
            return self.end(Outcome::unresolved(UnresolvedReason::EmptyCapture), on_stage);
        }
        self.save_debug(&run_id, "capture", &image);

        on_stage(PipelineStage::Detecting);
        let image = if self.auto_detect {
            match self.detector.detect(&image) {
                Some(found) => {
                    debug!("Text region {} inside the capture", found);
                    image.crop(&found)
                }
                None => {
                    debug!("No text region detected, keeping the whole capture");
                    image
                }
            }
        } else {
            image
        };
        self.save_debug(&run_id, "region", &image);

        on_stage(PipelineStage::Preprocessing);
        let started = Instant::now();
        let processed = self.preprocessor.preprocess(&image);
        debug!("Preprocessed in {:?}", started.elapsed());
        self.save_debug(&run_id, "preprocessed", &processed);

        on_stage(PipelineStage::Recognizing);
        let mut paths = vec![("preprocessed", processed)];
        if self.try_unprocessed && self.preprocessor.settings().enabled {
            paths.push(("minimal", self.preprocessor.minimal(&image)));
        }

        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut engine_error = None;
        for (name, path_image) in &paths {
            match self.ocr.extract_best(path_image, self.script) {
                Ok(Some(attempt)) => attempts.push((*name, attempt)),
                Ok(None) => debug!("No text on the {} image", name),
                Err(e) => {
                    warn!("Recognition on the {} image failed: {}", name, e);
                    engine_error = Some(e);
                }
            }
        }
        debug!("Recognized in {:?}", started.elapsed());

        if attempts.is_empty() {
            if let Some(e) = engine_error {
                return self.fail(e, UnresolvedReason::EngineUnavailable, on_stage);
            }
        }

        let raw = match best_of(attempts, |(_, attempt)| Some(attempt.quality)) {
            Some(best) => {
                if paths.len() > 1 {
                    info!("Using text from the {} image", best.value.0);
                }
                best.value.1.raw_text
            }
            None => String::new(),
        };

        self.finish(&raw, on_stage)
    }

    fn finish(&self, raw: &str, on_stage: &mut dyn FnMut(PipelineStage)) -> Outcome {
        on_stage(PipelineStage::Normalizing);
        let text = normalize(raw);
        if text.chars().count() < self.min_text_chars.max(1) {
            info!("No usable text recognized ({:?})", text);
            return self.end(Outcome::unresolved(UnresolvedReason::NoText), on_stage);
        }
        debug!("Normalized text: {}", text);

        on_stage(PipelineStage::Matching);
        let index = self.index.snapshot();
        let outcome = self.match_against(text, &index);
        self.end(outcome, on_stage)
    }

    fn match_against(&self, text: String, index: &QuestionIndex) -> Outcome {
        let result = self.matcher.find(&text, index);

        match result.entry {
            Some(entry) => {
                info!(
                    "Matched '{}' row {} with score {:.3}",
                    entry.source_id, entry.row, result.score
                );
                let matched_answer_text = entry.correct_text().unwrap_or_default().to_string();
                Outcome::Resolved(ResolvedAnswer {
                    question_text: entry.original_text,
                    matched_answer_label: entry.correct_label,
                    matched_answer_text,
                    score: result.score,
                    source_id: entry.source_id,
                })
            }
            None => {
                info!(
                    "No match above {:.2} (best {:.3}) among {} entries",
                    self.matcher.threshold(),
                    result.score,
                    index.len()
                );
                Outcome::Unresolved {
                    normalized_text: text,
                    reason: UnresolvedReason::NoMatch,
                    closest: result.rank,
                }
            }
        }
    }

    fn fail(&self, e: PipelineError, reason: UnresolvedReason, on_stage: &mut dyn FnMut(PipelineStage)) -> Outcome {
        error!("Run aborted: {}", e);
        self.end(Outcome::unresolved(reason), on_stage)
    }

    fn end(&self, outcome: Outcome, on_stage: &mut dyn FnMut(PipelineStage)) -> Outcome {
        on_stage(outcome.stage());
        outcome
    }

    fn save_debug(&self, run_id: &Uuid, stage: &str, image: &RawImage) {
        if let Some(sink) = &self.debug_sink {
            sink.save(run_id, stage, image);
        }
    }
}
