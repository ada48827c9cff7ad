//! Text cleanup for OCR output

pub mod normalize;

pub use normalize::normalize;
