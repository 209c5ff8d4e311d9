use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;
use ndarray::prelude::*;

use crate::errors::Result;
use crate::types::{Embeddings, ImageSize, MaskPrediction, PointPrompts, PreprocessedInputs};

/// 前処理・後処理の抽象化
///
/// Turns decoded pixels into model inputs and low resolution mask logits back into
/// masks at the original image resolution.
pub trait ImagePreprocessor: Send + Sync {
    fn process(&self, image: &RgbImage) -> Result<PreprocessedInputs>;

    /// `pred_masks` is `[point_batch, num_masks, h, w]`; the result has the same
    /// leading axes and `original` as its spatial size.
    fn post_process_masks(
        &self,
        pred_masks: ArrayView4<f32>,
        original: ImageSize,
        reshaped: ImageSize,
    ) -> Result<Array4<bool>>;
}

/// プロンプト付きセグメンテーションモデルの抽象化
///
/// The encoder half (`embed`) is the expensive call; `infer` runs per prompt set.
pub trait PromptSegmentationModel: Send + Sync {
    fn embed(&self, inputs: &PreprocessedInputs) -> Result<Embeddings>;

    fn infer(&self, embeddings: &Embeddings, prompts: &PointPrompts) -> Result<MaskPrediction>;
}

/// Loads the model and its preprocessor. Either call may fail with a load error.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    fn model_id(&self) -> &str;

    async fn load_model(&self) -> Result<Arc<dyn PromptSegmentationModel>>;

    async fn load_processor(&self) -> Result<Arc<dyn ImagePreprocessor>>;
}
