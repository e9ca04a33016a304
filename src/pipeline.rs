use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::error::{AppError, ErrorKind};
use crate::vision::{BodyPresenceGate, ImageClassifier, LabelNormalizer, Preprocessor};

/// Request lifecycle of one analysis. Any stage may move to `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    GateChecked,
    Preprocessed,
    Classified,
    Normalized,
    Responded,
    Errored,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::GateChecked => "gate_checked",
            Self::Preprocessed => "preprocessed",
            Self::Classified => "classified",
            Self::Normalized => "normalized",
            Self::Responded => "responded",
            Self::Errored => "errored",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PredictionError {
    #[error("must upload an image file")]
    NotAnImage,

    #[error("please upload an upper-body photo")]
    NoUpperBody,

    #[error("model prediction failed: {0}")]
    Failed(String),
}

impl PredictionError {
    fn reason(&self) -> &'static str {
        match self {
            Self::NotAnImage => "not_an_image",
            Self::NoUpperBody => "no_upper_body",
            Self::Failed(_) => "prediction_failed",
        }
    }
}

impl From<PredictionError> for AppError {
    fn from(e: PredictionError) -> Self {
        match e {
            PredictionError::NotAnImage | PredictionError::NoUpperBody => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
            PredictionError::Failed(_) => AppError::new(ErrorKind::Inference, e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub body_fat: String,
    pub confidence: f32,
}

/// `image/*`, compared case-insensitively. A missing content type is not an image.
pub fn is_image_content_type(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.get(..6))
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("image/"))
}

/// Gate, preprocess, classify and normalize one upload.
pub struct BodyFatAnalyzer {
    preprocessor: Preprocessor,
    gate: BodyPresenceGate,
    classifier: Arc<dyn ImageClassifier>,
    normalizer: LabelNormalizer,
}

impl BodyFatAnalyzer {
    pub fn new(
        preprocessor: Preprocessor,
        gate: BodyPresenceGate,
        classifier: Arc<dyn ImageClassifier>,
        normalizer: LabelNormalizer,
    ) -> Self {
        Self {
            preprocessor,
            gate,
            classifier,
            normalizer,
        }
    }

    /// Runs the whole pipeline on the blocking pool.
    #[instrument(skip(self, bytes), fields(data_len = bytes.len()))]
    pub async fn analyze(
        self: &Arc<Self>,
        content_type: Option<String>,
        bytes: bytes::Bytes,
    ) -> Result<PredictionResponse, PredictionError> {
        let start = Instant::now();
        counter!("bodyfat.analyze.requests").increment(1);

        let analyzer = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            analyzer.analyze_sync(content_type.as_deref(), &bytes)
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "analysis task failed");
            Err(PredictionError::Failed("analysis task failed".into()))
        });

        histogram!("bodyfat.analyze.duration_ms").record(start.elapsed().as_millis() as f64);

        match &result {
            Ok(_) => counter!("bodyfat.analyze.success").increment(1),
            Err(e) => counter!("bodyfat.analyze.errors", "reason" => e.reason()).increment(1),
        }

        result
    }

    pub fn analyze_sync(
        &self,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<PredictionResponse, PredictionError> {
        let mut stage = Stage::Received;
        let result = self.run(content_type, bytes, &mut stage);
        if let Err(e) = &result {
            match e {
                PredictionError::Failed(cause) => error!(
                    failed_after = stage.as_str(),
                    cause = %cause,
                    "body fat prediction failed"
                ),
                _ => warn!(failed_after = stage.as_str(), reason = e.reason(), "upload rejected"),
            }
        }
        result
    }

    fn run(
        &self,
        content_type: Option<&str>,
        bytes: &[u8],
        stage: &mut Stage,
    ) -> Result<PredictionResponse, PredictionError> {
        if !is_image_content_type(content_type) {
            return Err(PredictionError::NotAnImage);
        }

        // Decoded once, shared by the gate and the preprocessor.
        let decode_start = Instant::now();
        let img = self
            .preprocessor
            .decode(bytes)
            .map_err(|e| PredictionError::Failed(e.to_string()))?;
        histogram!("bodyfat.stage.decode_ms").record(decode_start.elapsed().as_secs_f64() * 1000.0);

        let gate_start = Instant::now();
        let has_upper_body = self.gate.has_upper_body(&img);
        histogram!("bodyfat.stage.gate_ms").record(gate_start.elapsed().as_secs_f64() * 1000.0);
        if !has_upper_body {
            return Err(PredictionError::NoUpperBody);
        }
        *stage = Stage::GateChecked;

        let tensor = self
            .preprocessor
            .normalize(&img)
            .map_err(|e| PredictionError::Failed(e.to_string()))?;
        *stage = Stage::Preprocessed;

        let classify_start = Instant::now();
        let result = self
            .classifier
            .classify(&tensor)
            .map_err(|e| PredictionError::Failed(e.to_string()))?;
        histogram!("bodyfat.stage.classify_ms")
            .record(classify_start.elapsed().as_secs_f64() * 1000.0);
        *stage = Stage::Classified;

        let body_fat = self.normalizer.normalize(&result.raw_label).into_owned();
        *stage = Stage::Normalized;

        debug!(
            class_index = result.class_index,
            body_fat = %body_fat,
            confidence = result.confidence,
            "body fat classified"
        );
        *stage = Stage::Responded;

        Ok(PredictionResponse {
            body_fat,
            confidence: result.confidence,
        })
    }
}

#[cfg(feature = "ml")]
pub use startup::load_analyzer;

#[cfg(feature = "ml")]
mod startup {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::StartupError;
    use crate::vision::classifier::OnnxClassifier;
    use crate::vision::loader::ModelLoader;
    use crate::vision::preprocess::PreprocessConfig;
    use crate::vision::segmenter::{OnnxSegmenter, SEGMENTER_INPUT_SIZE};
    use crate::vision::LabelSet;
    use tracing::info;

    /// Loads labels and both models. Any failure here is fatal.
    pub fn load_analyzer(config: &AppConfig) -> Result<BodyFatAnalyzer, StartupError> {
        let labels = LabelSet::load(&config.models.labels)?;
        let normalizer = LabelNormalizer::new(&config.label_prefix_pattern)?;

        let loader = ModelLoader::new(config.legacy_attributes.clone());
        let classifier_session = loader.load(&config.models.classifier)?;
        let segmenter_session = loader.load(&config.models.segmenter)?;

        info!(
            classifier = %config.models.classifier.display(),
            segmenter = %config.models.segmenter.display(),
            classes = labels.len(),
            "models ready"
        );

        let classifier = Arc::new(OnnxClassifier::new(classifier_session, labels));
        let segmenter = Arc::new(OnnxSegmenter::new(segmenter_session, SEGMENTER_INPUT_SIZE));
        let preprocessor = Preprocessor::new(PreprocessConfig {
            max_input_bytes: config.max_upload_bytes,
            ..PreprocessConfig::default()
        });

        Ok(BodyFatAnalyzer::new(
            preprocessor,
            BodyPresenceGate::new(segmenter, config.gate),
            classifier,
            normalizer,
        ))
    }
}
