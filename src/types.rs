use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SamSegError};

/// Image dimensions in model order: height first, then width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl ImageSize {
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    /// `[height, width]`, the tuple layout the model tensors use.
    pub const fn as_hw(&self) -> [u32; 2] {
        [self.height, self.width]
    }
}

/// Output of the preprocessor for one image.
#[derive(Debug, Clone)]
pub struct PreprocessedInputs {
    /// `[1, 3, pad_h, pad_w]` normalised pixels.
    pub pixel_values: Array4<f32>,
    /// Size of the decoded image before resizing.
    pub original_size: ImageSize,
    /// Size after the longest-edge resize, before padding.
    pub reshaped_size: ImageSize,
}

/// Vision encoder output. Always stored and retrieved together with the
/// [`PreprocessedInputs`] it was computed from.
#[derive(Debug, Clone)]
pub struct Embeddings {
    pub image_embeddings: Array4<f32>,
    pub positional_embeddings: Array4<f32>,
}

/// Foreground/background click on the image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    /// `[x, y]`, both normalised to `[0, 1]`.
    pub point: [f32; 2],
    /// 1 = foreground, 0 = background.
    pub label: i64,
}

impl Prompt {
    pub const FOREGROUND: i64 = 1;
    pub const BACKGROUND: i64 = 0;

    pub const fn foreground(x: f32, y: f32) -> Self {
        Self {
            point: [x, y],
            label: Self::FOREGROUND,
        }
    }

    pub const fn background(x: f32, y: f32) -> Self {
        Self {
            point: [x, y],
            label: Self::BACKGROUND,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.point.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)) {
            return Err(SamSegError::InvalidRequest {
                kind: "decode".to_string(),
                reason: format!("point {:?} is not normalised to [0, 1]", self.point),
            });
        }
        if self.label != Self::FOREGROUND && self.label != Self::BACKGROUND {
            return Err(SamSegError::InvalidRequest {
                kind: "decode".to_string(),
                reason: format!("label {} is neither 0 nor 1", self.label),
            });
        }
        Ok(())
    }

    /// Maps the normalised point into the pixel space of the resized model input.
    ///
    /// The first coordinate scales with the second component of the `(height, width)`
    /// size and the second coordinate with the first component.
    pub fn to_pixel(&self, reshaped: ImageSize) -> [f32; 2] {
        let [h, w] = reshaped.as_hw();
        [self.point[0] * w as f32, self.point[1] * h as f32]
    }
}

/// Decoder point inputs, in prompt order.
#[derive(Debug, Clone, PartialEq)]
pub struct PointPrompts {
    /// `[1, 1, N, 2]` pixel coordinates.
    pub coords: Array4<f32>,
    /// `[1, 1, N]` labels.
    pub labels: Array3<i64>,
}

impl PointPrompts {
    pub fn from_prompts(prompts: &[Prompt], reshaped: ImageSize) -> Result<Self> {
        if prompts.is_empty() {
            return Err(SamSegError::InvalidRequest {
                kind: "decode".to_string(),
                reason: "at least one prompt is required".to_string(),
            });
        }

        let n = prompts.len();
        let mut coords = Array4::<f32>::zeros((1, 1, n, 2));
        let mut labels = Array3::<i64>::zeros((1, 1, n));
        for (i, prompt) in prompts.iter().enumerate() {
            prompt.validate()?;
            let [x, y] = prompt.to_pixel(reshaped);
            coords[[0, 0, i, 0]] = x;
            coords[[0, 0, i, 1]] = y;
            labels[[0, 0, i]] = prompt.label;
        }

        Ok(Self { coords, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Raw decoder output.
#[derive(Debug, Clone)]
pub struct MaskPrediction {
    /// `[point_batch, num_masks, h, w]` low resolution mask logits.
    pub pred_masks: Array4<f32>,
    /// `[point_batch, num_masks]` predicted IoU per candidate mask.
    pub iou_scores: Array2<f32>,
}

impl MaskPrediction {
    pub fn scores(&self) -> Vec<f32> {
        self.iou_scores.iter().copied().collect()
    }
}
