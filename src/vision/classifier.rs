use serde::{Deserialize, Serialize};

use super::labels::LabelSet;
use super::preprocess::NormalizedTensor;
use super::VisionError;

/// Tolerance when deciding whether model scores already form a distribution.
const DISTRIBUTION_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct ClassificationResult {
    /// Label as written in the label file, class-index prefix included.
    pub raw_label: String,
    /// Probability of the arg-max class, in `[0, 1]`.
    pub confidence: f32,
    pub class_index: usize,
}

/// Pretrained classifier behind a `classify(tensor)` contract.
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, tensor: &NormalizedTensor) -> Result<ClassificationResult, VisionError>;
}

/// Converts raw model scores to probabilities, applying softmax to logits.
pub fn probabilities(scores: &[f32]) -> Result<Vec<f32>, VisionError> {
    if scores.is_empty() {
        return Err(VisionError::InvalidShape {
            expected: "at least one class score".into(),
            got: "0 scores".into(),
        });
    }
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(VisionError::NonFiniteOutput);
    }

    let in_range = scores.iter().all(|s| (0.0..=1.0).contains(s));
    let sum: f32 = scores.iter().sum();
    if in_range && (sum - 1.0).abs() <= DISTRIBUTION_TOLERANCE {
        return Ok(scores.to_vec());
    }

    Ok(softmax(scores))
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Index and value of the largest element; the first wins on ties.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (idx, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((idx, v)),
        })
}

/// Picks the top class from raw scores and resolves its label.
pub fn select(scores: &[f32], labels: &LabelSet) -> Result<ClassificationResult, VisionError> {
    if scores.len() != labels.len() {
        return Err(VisionError::LabelCountMismatch {
            expected: labels.len(),
            got: scores.len(),
        });
    }

    let probs = probabilities(scores)?;
    let (class_index, confidence) = argmax(&probs).ok_or(VisionError::NonFiniteOutput)?;
    let raw_label = labels
        .get(class_index)
        .ok_or(VisionError::LabelCountMismatch {
            expected: labels.len(),
            got: scores.len(),
        })?
        .to_string();

    Ok(ClassificationResult {
        raw_label,
        confidence: confidence.clamp(0.0, 1.0),
        class_index,
    })
}

#[cfg(feature = "ml")]
pub use onnx::OnnxClassifier;

#[cfg(feature = "ml")]
mod onnx {
    use std::sync::Mutex;
    use std::time::Instant;

    use ort::session::Session;
    use ort::value::TensorRef;
    use tracing::{debug, instrument};

    use super::*;
    use crate::vision::MODEL_INPUT_SIZE;

    /// Body-fat classifier over an ONNX session and its label list.
    ///
    /// Inference is serialized through the session mutex.
    pub struct OnnxClassifier {
        session: Mutex<Session>,
        labels: LabelSet,
    }

    impl OnnxClassifier {
        pub fn new(session: Session, labels: LabelSet) -> Self {
            Self {
                session: Mutex::new(session),
                labels,
            }
        }

        pub fn labels(&self) -> &LabelSet {
            &self.labels
        }
    }

    impl ImageClassifier for OnnxClassifier {
        #[instrument(skip(self, tensor))]
        fn classify(&self, tensor: &NormalizedTensor) -> Result<ClassificationResult, VisionError> {
            let side = MODEL_INPUT_SIZE as usize;
            if tensor.array().shape() != [1, side, side, 3] {
                return Err(VisionError::InvalidShape {
                    expected: format!("[1, {side}, {side}, 3]"),
                    got: format!("{:?}", tensor.array().shape()),
                });
            }

            let start = Instant::now();
            let input = TensorRef::from_array_view(tensor.array().view())?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| VisionError::Processing("Session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![input])?;
            let (shape, scores) = outputs[0].try_extract_tensor::<f32>()?;

            let batch_of_one = match shape.len() {
                1 => true,
                2 => shape[0] == 1,
                _ => false,
            };
            if !batch_of_one {
                return Err(VisionError::InvalidShape {
                    expected: "[1, classes] or [classes]".into(),
                    got: format!("{:?}", &shape[..]),
                });
            }

            let result = select(scores, &self.labels)?;
            debug!(
                class_index = result.class_index,
                confidence = result.confidence,
                inference_ms = start.elapsed().as_secs_f64() * 1000.0,
                "classification completed"
            );
            Ok(result)
        }
    }
}
