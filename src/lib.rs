//! quizlens
//!
//! Captures a screen region, recognizes the text in it and resolves the
//! question against a local question bank, handing unmatched questions to an
//! external fallback oracle.

pub mod app;
pub mod bank;
pub mod capture;
pub mod config;
pub mod error;
pub mod hotkey;
pub mod pipeline;
pub mod select;
pub mod shared;
pub mod storage;
pub mod text;
pub mod vision;

pub use error::PipelineError;
