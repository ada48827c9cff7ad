//! Run-level error taxonomy
//!
//! Only these conditions end a pipeline run early. Empty captures, empty OCR
//! text and missing matches are normal terminal states, not errors.

use thiserror::Error;

/// Failures that abort the current run (never the process)
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Every capture strategy failed or timed out
    #[error("no capture backend could grab the screen: {0}")]
    CaptureUnavailable(String),

    /// The OCR backend could not be invoked for any variant
    #[error("OCR engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Some question bank sources were skipped during load
    #[error("question bank partially loaded, {failed} of {total} sources skipped")]
    BankLoadPartialFailure { failed: usize, total: usize },
}
