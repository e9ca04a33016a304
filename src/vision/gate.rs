use std::sync::Arc;

use image::DynamicImage;
use ndarray::{s, Array2};
use tracing::{debug, warn};

use super::VisionError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateConfig {
    /// Mask values strictly above this count as person pixels.
    pub mask_threshold: f32,
    /// Fraction of top-half pixels that must be person pixels.
    pub min_top_half_coverage: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mask_threshold: 0.5,
            min_top_half_coverage: 0.10,
        }
    }
}

/// Produces a per-pixel person probability mask (`rows x cols`, values in `[0, 1]`).
pub trait PersonSegmenter: Send + Sync {
    fn segment(&self, img: &DynamicImage) -> Result<Array2<f32>, VisionError>;
}

#[derive(Clone)]
pub struct BodyPresenceGate {
    segmenter: Arc<dyn PersonSegmenter>,
    config: GateConfig,
}

impl BodyPresenceGate {
    pub fn new(segmenter: Arc<dyn PersonSegmenter>, config: GateConfig) -> Self {
        Self { segmenter, config }
    }

    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// True when the top half of the frame carries enough person pixels.
    ///
    /// A segmenter failure is a rejection, never an error.
    pub fn has_upper_body(&self, img: &DynamicImage) -> bool {
        let mask = match self.segmenter.segment(img) {
            Ok(mask) => mask,
            Err(e) => {
                warn!(error = %e, "segmentation produced no mask");
                return false;
            }
        };

        let coverage = top_half_coverage(&mask, self.config.mask_threshold);
        let accepted = coverage >= self.config.min_top_half_coverage;
        debug!(
            coverage,
            min_coverage = self.config.min_top_half_coverage,
            accepted,
            "upper body gate evaluated"
        );
        accepted
    }
}

/// Fraction of mask values above `threshold` within rows `0..h/2`.
///
/// An empty top half yields `0.0`.
pub fn top_half_coverage(mask: &Array2<f32>, threshold: f32) -> f32 {
    let (rows, cols) = mask.dim();
    let top_rows = rows / 2;
    if top_rows == 0 || cols == 0 {
        return 0.0;
    }

    let top = mask.slice(s![..top_rows, ..]);
    let hits = top.iter().filter(|&&v| v > threshold).count();
    hits as f32 / top.len() as f32
}
