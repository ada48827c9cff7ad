//! Events sent from the worker to the presentation side

use crate::pipeline::{Outcome, PipelineStage};

/// What an [`AnswerSink`](crate::app::AnswerSink) is shown
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// The run entered a new stage
    Stage(PipelineStage),
    /// The run finished
    Outcome(Outcome),
    /// Reply of the generative fallback for unresolved text
    Fallback {
        question: String,
        /// The answer, or the failure message
        answer: Result<String, String>,
    },
}
