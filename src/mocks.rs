use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::errors::{Result, SamSegError};
use crate::traits::{ImagePreprocessor, ModelLoader, PromptSegmentationModel};
use crate::types::{Embeddings, ImageSize, MaskPrediction, PointPrompts, PreprocessedInputs};

/// テスト用モックの入力サイズ（最長辺）
pub const MOCK_INPUT_SIZE: u32 = 64;

/// テスト用モックの低解像度マスクサイズ
pub const MOCK_MASK_SIZE: usize = 8;

pub const MOCK_SCORES: [f32; 3] = [0.9, 0.6, 0.3];

/// Call counters shared by every mock created from one [`MockLoader`].
#[derive(Debug, Default)]
pub struct MockCounters {
    model_loads: AtomicUsize,
    processor_loads: AtomicUsize,
    process_calls: AtomicUsize,
    embed_calls: AtomicUsize,
    infer_calls: AtomicUsize,
    last_prompts: Mutex<Option<PointPrompts>>,
}

impl MockCounters {
    pub fn model_loads(&self) -> usize {
        self.model_loads.load(Ordering::SeqCst)
    }

    pub fn processor_loads(&self) -> usize {
        self.processor_loads.load(Ordering::SeqCst)
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn infer_calls(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }

    /// Point tensors handed to the most recent `infer` call.
    pub fn last_prompts(&self) -> Option<PointPrompts> {
        self.last_prompts.lock().clone()
    }
}

/// テスト用のモックローダー
#[derive(Debug, Clone)]
pub struct MockLoader {
    counters: Arc<MockCounters>,
    load_delay: Duration,
    embed_delay: Duration,
    failing_loads: Arc<AtomicUsize>,
    fail_embedding: bool,
    fail_inference: bool,
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(MockCounters::default()),
            load_delay: Duration::ZERO,
            embed_delay: Duration::ZERO,
            failing_loads: Arc::new(AtomicUsize::new(0)),
            fail_embedding: false,
            fail_inference: false,
        }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Every `embed` call blocks its thread for `delay` before returning.
    pub fn with_embed_delay(mut self, delay: Duration) -> Self {
        self.embed_delay = delay;
        self
    }

    /// The first `count` model loads fail.
    pub fn failing_loads(self, count: usize) -> Self {
        self.failing_loads.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_embedding(mut self) -> Self {
        self.fail_embedding = true;
        self
    }

    pub fn failing_inference(mut self) -> Self {
        self.fail_inference = true;
        self
    }
}

impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelLoader for MockLoader {
    fn model_id(&self) -> &str {
        "mock/sam"
    }

    async fn load_model(&self) -> Result<Arc<dyn PromptSegmentationModel>> {
        self.counters.model_loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }

        let should_fail = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SamSegError::load(
                self.model_id(),
                "model",
                std::io::Error::new(std::io::ErrorKind::NotFound, "mock model unavailable"),
            ));
        }

        Ok(Arc::new(MockModel {
            counters: Arc::clone(&self.counters),
            embed_delay: self.embed_delay,
            fail_embedding: self.fail_embedding,
            fail_inference: self.fail_inference,
        }))
    }

    async fn load_processor(&self) -> Result<Arc<dyn ImagePreprocessor>> {
        self.counters.processor_loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        Ok(Arc::new(MockProcessor {
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// テスト用のモック前処理
#[derive(Debug)]
pub struct MockProcessor {
    counters: Arc<MockCounters>,
}

impl MockProcessor {
    pub fn new(counters: Arc<MockCounters>) -> Self {
        Self { counters }
    }
}

impl ImagePreprocessor for MockProcessor {
    fn process(&self, image: &RgbImage) -> Result<PreprocessedInputs> {
        self.counters.process_calls.fetch_add(1, Ordering::SeqCst);

        let (width, height) = image.dimensions();
        let longest = width.max(height).max(1) as f32;
        let scale = MOCK_INPUT_SIZE as f32 / longest;
        let reshaped = ImageSize::new(
            ((height as f32 * scale).round() as u32).max(1),
            ((width as f32 * scale).round() as u32).max(1),
        );

        Ok(PreprocessedInputs {
            pixel_values: Array4::zeros((1, 3, MOCK_INPUT_SIZE as usize, MOCK_INPUT_SIZE as usize)),
            original_size: ImageSize::new(height, width),
            reshaped_size: reshaped,
        })
    }

    fn post_process_masks(
        &self,
        pred_masks: ArrayView4<f32>,
        original: ImageSize,
        _reshaped: ImageSize,
    ) -> Result<Array4<bool>> {
        let (batch, masks, low_h, low_w) = pred_masks.dim();
        let (out_h, out_w) = (original.height as usize, original.width as usize);

        // 最近傍で元画像サイズに拡大
        Ok(Array4::from_shape_fn(
            (batch, masks, out_h, out_w),
            |(b, m, y, x)| pred_masks[[b, m, y * low_h / out_h, x * low_w / out_w]] > 0.0,
        ))
    }
}

/// テスト用のモックモデル
#[derive(Debug)]
pub struct MockModel {
    counters: Arc<MockCounters>,
    embed_delay: Duration,
    fail_embedding: bool,
    fail_inference: bool,
}

impl MockModel {
    pub fn new(counters: Arc<MockCounters>) -> Self {
        Self {
            counters,
            embed_delay: Duration::ZERO,
            fail_embedding: false,
            fail_inference: false,
        }
    }
}

impl PromptSegmentationModel for MockModel {
    fn embed(&self, _inputs: &PreprocessedInputs) -> Result<Embeddings> {
        let call = self.counters.embed_calls.fetch_add(1, Ordering::SeqCst);
        if !self.embed_delay.is_zero() {
            std::thread::sleep(self.embed_delay);
        }
        if self.fail_embedding {
            return Err(SamSegError::inference(
                "vision encoder",
                "mock backend out of memory",
            ));
        }

        // 呼び出しごとに異なる値を持たせて再計算を検出できるようにする
        Ok(Embeddings {
            image_embeddings: Array4::from_elem((1, 4, 2, 2), call as f32),
            positional_embeddings: Array4::zeros((1, 4, 2, 2)),
        })
    }

    fn infer(&self, _embeddings: &Embeddings, prompts: &PointPrompts) -> Result<MaskPrediction> {
        self.counters.infer_calls.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_prompts.lock() = Some(prompts.clone());
        if self.fail_inference {
            return Err(SamSegError::inference(
                "mask decoder",
                "mock backend out of memory",
            ));
        }

        // マスク0: 全面, マスク1: 左半分, マスク2: 空
        let pred_masks = Array4::from_shape_fn(
            (1, 3, MOCK_MASK_SIZE, MOCK_MASK_SIZE),
            |(_, m, _, x)| match m {
                0 => 1.0,
                1 if x < MOCK_MASK_SIZE / 2 => 1.0,
                _ => -1.0,
            },
        );

        Ok(MaskPrediction {
            pred_masks,
            iou_scores: Array2::from_shape_vec((1, 3), MOCK_SCORES.to_vec())?,
        })
    }
}
