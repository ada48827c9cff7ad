//! Vision/OCR Layer
//!
//! Text region detection, image preprocessing and text recognition on
//! captured images.

pub mod detection;
pub mod ocr;
pub mod preprocess;
pub mod tesseract;

pub use detection::RegionDetector;
pub use ocr::{OcrAttempt, OcrBackend, OcrBackendError, OcrEngine, OcrOutput, OcrRequest};
pub use preprocess::ImagePreprocessor;
pub use tesseract::{EngineHealth, TesseractBackend};
