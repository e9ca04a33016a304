//! Image decoding, the upper-body gate and the body-fat classifier.

pub mod classifier;
pub mod gate;
pub mod labels;
pub mod loader;
pub mod onnx_proto;
pub mod preprocess;
#[cfg(feature = "ml")]
pub mod segmenter;

use thiserror::Error;

pub use classifier::{ClassificationResult, ImageClassifier};
pub use gate::{BodyPresenceGate, GateConfig, PersonSegmenter};
pub use labels::{LabelNormalizer, LabelSet};
pub use preprocess::{NormalizedTensor, PreprocessConfig, Preprocessor};

/// Side length of the square classifier input.
pub const MODEL_INPUT_SIZE: u32 = 224;

// ============================================================================
// Error Types (sanitized for external consumption)
// ============================================================================

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),

    #[error("input bytes empty")]
    EmptyInput,

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("image too large: {width}x{height} pixels, max {max_pixels}")]
    PixelCountTooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("inference engine error")]
    InferenceEngine(String), // Sanitized - no raw ORT errors

    #[error("invalid tensor shape: expected {expected}, got {got}")]
    InvalidShape { expected: String, got: String },

    #[error("model output has {got} scores but {expected} labels are loaded")]
    LabelCountMismatch { expected: usize, got: usize },

    #[error("model output contains non-finite scores")]
    NonFiniteOutput,

    #[error("processing error: {0}")]
    Processing(String),
}

#[cfg(feature = "ml")]
impl From<ort::Error> for VisionError {
    fn from(e: ort::Error) -> Self {
        // Log full error internally, return sanitized version externally
        tracing::error!(error = %e, "ORT inference error");
        VisionError::InferenceEngine("internal inference error".into())
    }
}
