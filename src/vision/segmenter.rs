use std::sync::Mutex;

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use tracing::instrument;

use super::gate::PersonSegmenter;
use super::VisionError;

/// Input side of the MediaPipe-style selfie segmentation model.
pub const SEGMENTER_INPUT_SIZE: u32 = 256;

/// Person segmentation backed by an ONNX model taking `1 x S x S x 3` floats in `[0, 1]`.
pub struct OnnxSegmenter {
    session: Mutex<Session>,
    input_size: u32,
}

impl OnnxSegmenter {
    pub fn new(session: Session, input_size: u32) -> Self {
        Self {
            session: Mutex::new(session),
            input_size,
        }
    }

    fn input_tensor(&self, img: &DynamicImage) -> Result<Array4<f32>, VisionError> {
        let side = self.input_size as usize;
        let rgb = img
            .resize_exact(self.input_size, self.input_size, FilterType::Triangle)
            .to_rgb8();
        let data: Vec<f32> = rgb.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect();
        Array4::from_shape_vec((1, side, side, 3), data)
            .map_err(|e| VisionError::Processing(e.to_string()))
    }
}

impl PersonSegmenter for OnnxSegmenter {
    #[instrument(skip(self, img), fields(width = img.width(), height = img.height()))]
    fn segment(&self, img: &DynamicImage) -> Result<Array2<f32>, VisionError> {
        let input = self.input_tensor(img)?;
        let tensor = TensorRef::from_array_view(input.view())?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| VisionError::Processing("Session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![tensor])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        mask_from_output(shape, data, self.input_size as usize)
    }
}

/// Turns a raw segmentation output into a `side x side` person mask.
///
/// Accepts a single person channel (`[1,H,W,1]`, `[1,1,H,W]`, `[1,H,W]`) or a
/// background/person pair (`[1,H,W,2]` interleaved, `[1,2,H,W]` planar). Logits are
/// squashed through a sigmoid.
pub fn mask_from_output(
    shape: &[i64],
    data: &[f32],
    side: usize,
) -> Result<Array2<f32>, VisionError> {
    let expected = side * side;
    let bad_shape = || VisionError::InvalidShape {
        expected: format!("{expected} or {} mask values", expected * 2),
        got: format!("{shape:?} ({} values)", data.len()),
    };

    let mut values = if data.len() == expected {
        data.to_vec()
    } else if data.len() == expected * 2 {
        let interleaved = shape.last() == Some(&2);
        let planar = shape.len() == 4 && shape[1] == 2;
        if planar && !interleaved {
            data[expected..].to_vec()
        } else {
            data.iter().skip(1).step_by(2).copied().collect()
        }
    } else {
        return Err(bad_shape());
    };

    if values.iter().any(|v| !v.is_finite()) {
        return Err(VisionError::NonFiniteOutput);
    }

    if looks_like_logits(&values) {
        values.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp()));
    }

    Array2::from_shape_vec((side, side), values).map_err(|_| bad_shape())
}

fn looks_like_logits(values: &[f32]) -> bool {
    values.iter().any(|&v| !(-0.01..=1.01).contains(&v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_channel_passes_through() {
        let mask = mask_from_output(&[1, 2, 2, 1], &[0.0, 0.25, 0.5, 1.0], 2).unwrap();
        assert_eq!(mask, Array2::from_shape_vec((2, 2), vec![0.0, 0.25, 0.5, 1.0]).unwrap());
    }

    #[test]
    fn interleaved_pair_takes_person_channel() {
        let data = [0.1, 0.9, 0.2, 0.8, 0.3, 0.7, 0.4, 0.6];
        let mask = mask_from_output(&[1, 2, 2, 2], &data, 2).unwrap();
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![0.9, 0.8, 0.7, 0.6]);
    }

    #[test]
    fn planar_pair_takes_second_plane() {
        let mut data = vec![0.1; 9];
        data.extend([0.9, 0.8, 0.7, 0.6, 0.5, 0.4, 0.3, 0.2, 0.1]);
        let mask = mask_from_output(&[1, 2, 3, 3], &data, 3).unwrap();
        assert_eq!(mask[[0, 0]], 0.9);
        assert_eq!(mask[[2, 2]], 0.1);
    }

    #[test]
    fn logits_are_squashed() {
        let mask = mask_from_output(&[1, 1, 2, 2], &[-4.0, 0.0, 4.0, 8.0], 2).unwrap();
        assert!(mask.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!((mask[[0, 1]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn rejects_wrong_size_and_nan() {
        assert!(mask_from_output(&[1, 3], &[0.0, 0.1, 0.2], 2).is_err());
        assert!(matches!(
            mask_from_output(&[1, 2, 2, 1], &[0.0, f32::NAN, 0.5, 1.0], 2),
            Err(VisionError::NonFiniteOutput)
        ));
    }
}
