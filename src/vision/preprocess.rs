use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader, Limits};
use ndarray::Array4;
use tracing::instrument;

use super::{VisionError, MODEL_INPUT_SIZE};

#[derive(Clone, Debug)]
pub struct PreprocessConfig {
    pub max_input_bytes: usize,
    pub max_image_pixels: u64,
    pub max_dimension: u32,
    pub max_alloc_bytes: u64,
    pub input_size: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 10 * 1024 * 1024,
            max_image_pixels: 100_000_000,
            max_dimension: 15_000,
            max_alloc_bytes: 512 * 1024 * 1024,
            input_size: MODEL_INPUT_SIZE,
        }
    }
}

/// A `1 x S x S x 3` (NHWC) batch of one image, every value in `[-1, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedTensor(Array4<f32>);

impl NormalizedTensor {
    /// Wraps an existing array after checking it has the single-image NHWC layout.
    pub fn from_array(array: Array4<f32>, size: u32) -> Result<Self, VisionError> {
        let expected = [1, size as usize, size as usize, 3];
        if array.shape() != expected {
            return Err(VisionError::InvalidShape {
                expected: format!("{expected:?}"),
                got: format!("{:?}", array.shape()),
            });
        }
        Ok(Self(array))
    }

    pub fn array(&self) -> &Array4<f32> {
        &self.0
    }

    pub fn into_array(self) -> Array4<f32> {
        self.0
    }
}

#[derive(Clone, Debug, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Decodes untrusted bytes with size, dimension and allocation limits applied.
    #[instrument(skip(self, raw_bytes), fields(data_len = raw_bytes.len()))]
    pub fn decode(&self, raw_bytes: &[u8]) -> Result<DynamicImage, VisionError> {
        if raw_bytes.is_empty() {
            return Err(VisionError::EmptyInput);
        }

        if raw_bytes.len() > self.config.max_input_bytes {
            return Err(VisionError::InputTooLarge {
                size: raw_bytes.len(),
                max_size: self.config.max_input_bytes,
            });
        }

        let mut reader = ImageReader::new(Cursor::new(raw_bytes))
            .with_guessed_format()
            .map_err(|e| VisionError::Decode(e.into()))?;

        if reader.format().is_none() {
            return Err(VisionError::UnsupportedFormat);
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.config.max_dimension);
        limits.max_image_height = Some(self.config.max_dimension);
        limits.max_alloc = Some(self.config.max_alloc_bytes);
        reader.limits(limits);

        let img = reader.decode().map_err(VisionError::Decode)?;
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(VisionError::InvalidDimensions { width, height });
        }

        let pixels = u64::from(width) * u64::from(height);
        if pixels > self.config.max_image_pixels {
            return Err(VisionError::PixelCountTooLarge {
                width,
                height,
                max_pixels: self.config.max_image_pixels,
            });
        }

        Ok(img)
    }

    /// Centre-crops to a square, resamples with Lanczos3 and rescales to `[-1, 1]`.
    pub fn normalize(&self, img: &DynamicImage) -> Result<NormalizedTensor, VisionError> {
        let size = self.config.input_size;
        let fitted = fit_square(img, size)?;
        let rgb = fitted.to_rgb8();

        let side = size as usize;
        let data: Vec<f32> = rgb.as_raw().iter().map(|&v| rescale_pixel(v)).collect();
        let array = Array4::from_shape_vec((1, side, side, 3), data)
            .map_err(|e| VisionError::Processing(e.to_string()))?;

        NormalizedTensor::from_array(array, size)
    }

    pub fn preprocess(&self, raw_bytes: &[u8]) -> Result<NormalizedTensor, VisionError> {
        let img = self.decode(raw_bytes)?;
        self.normalize(&img)
    }
}

/// Crops the largest centred square and resizes it to `size x size`.
pub fn fit_square(img: &DynamicImage, size: u32) -> Result<DynamicImage, VisionError> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 || size == 0 {
        return Err(VisionError::InvalidDimensions { width, height });
    }

    let side = width.min(height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;

    Ok(img
        .crop_imm(x, y, side, side)
        .resize_exact(size, size, FilterType::Lanczos3))
}

#[inline]
pub fn rescale_pixel(value: u8) -> f32 {
    f32::from(value) / 127.5 - 1.0
}
