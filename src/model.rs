use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::{imageops, imageops::FilterType, ImageBuffer, Luma, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Deserialize;

use crate::config::{Backend, Config};
use crate::errors::{Result, SamSegError};
use crate::traits::{ImagePreprocessor, ModelLoader, PromptSegmentationModel};
use crate::types::{Embeddings, ImageSize, MaskPrediction, PointPrompts, PreprocessedInputs};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LongestEdge {
    pub longest_edge: u32,
}

/// Subset of `preprocessor_config.json` the processor needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreprocessorSettings {
    pub size: LongestEdge,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
    pub pad_size: ImageSize,
}

impl Default for PreprocessorSettings {
    fn default() -> Self {
        Self {
            size: LongestEdge { longest_edge: 1024 },
            image_mean: [0.485, 0.456, 0.406],
            image_std: [0.229, 0.224, 0.225],
            rescale_factor: 1.0 / 255.0,
            pad_size: ImageSize::new(1024, 1024),
        }
    }
}

/// Resizes, normalises and pads images for the vision encoder, and maps decoder
/// logits back to the original resolution.
#[derive(Debug, Clone)]
pub struct SamProcessor {
    settings: PreprocessorSettings,
}

impl SamProcessor {
    pub fn new(settings: PreprocessorSettings) -> Result<Self> {
        let LongestEdge { longest_edge } = settings.size;
        if longest_edge == 0
            || longest_edge > settings.pad_size.height
            || longest_edge > settings.pad_size.width
        {
            return Err(SamSegError::Configuration {
                message: format!(
                    "longest_edge {} does not fit pad size {:?}",
                    longest_edge, settings.pad_size
                ),
            });
        }
        Ok(Self { settings })
    }

    pub const fn settings(&self) -> &PreprocessorSettings {
        &self.settings
    }

    /// Size after scaling the longest side to `longest_edge`, aspect ratio kept.
    pub fn reshaped_size(&self, original: ImageSize) -> ImageSize {
        let target = self.settings.size.longest_edge as f64;
        let scale = target / original.height.max(original.width) as f64;
        let scaled = |v: u32| ((v as f64 * scale + 0.5) as u32).clamp(1, target as u32);
        ImageSize::new(scaled(original.height), scaled(original.width))
    }
}

impl ImagePreprocessor for SamProcessor {
    fn process(&self, image: &RgbImage) -> Result<PreprocessedInputs> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(SamSegError::InvalidRequest {
                kind: "segment".to_string(),
                reason: "image has no pixels".to_string(),
            });
        }

        let original_size = ImageSize::new(height, width);
        let reshaped_size = self.reshaped_size(original_size);
        let resized = imageops::resize(
            image,
            reshaped_size.width,
            reshaped_size.height,
            FilterType::Triangle,
        );

        let PreprocessorSettings {
            image_mean,
            image_std,
            rescale_factor,
            pad_size,
            ..
        } = self.settings;

        // (channel, height, width)
        let channels = resized.as_ndarray3();
        let (rh, rw) = (reshaped_size.height as usize, reshaped_size.width as usize);
        let mut pixel_values =
            Array4::<f32>::zeros((1, 3, pad_size.height as usize, pad_size.width as usize));
        for c in 0..3 {
            let (mean, std) = (image_mean[c], image_std[c]);
            pixel_values
                .slice_mut(s![0, c, ..rh, ..rw])
                .zip_mut_with(&channels.slice(s![c, .., ..]), |dst, &src| {
                    *dst = (src as f32 * rescale_factor - mean) / std;
                });
        }

        Ok(PreprocessedInputs {
            pixel_values,
            original_size,
            reshaped_size,
        })
    }

    fn post_process_masks(
        &self,
        pred_masks: ArrayView4<f32>,
        original: ImageSize,
        reshaped: ImageSize,
    ) -> Result<Array4<bool>> {
        let (batch, num_masks, low_h, low_w) = pred_masks.dim();
        let pad = self.settings.pad_size;

        let rendered = (0..batch * num_masks)
            .into_par_iter()
            .map(|i| {
                let logits = pred_masks.slice(s![i / num_masks, i % num_masks, .., ..]);
                upscale_mask(logits, low_w, low_h, pad, reshaped, original)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut masks = Array4::<bool>::from_elem(
            (
                batch,
                num_masks,
                original.height as usize,
                original.width as usize,
            ),
            false,
        );
        for (i, mask) in rendered.into_iter().enumerate() {
            masks
                .slice_mut(s![i / num_masks, i % num_masks, .., ..])
                .assign(&mask);
        }
        Ok(masks)
    }
}

/// Logits → pad size → crop to the resized image → original size → binary mask.
fn upscale_mask(
    logits: ArrayView2<f32>,
    low_w: usize,
    low_h: usize,
    pad: ImageSize,
    reshaped: ImageSize,
    original: ImageSize,
) -> Result<Array2<bool>> {
    let raw = logits.as_standard_layout().into_owned().into_raw_vec_and_offset().0;
    let low: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(low_w as u32, low_h as u32, raw).ok_or_else(|| {
            SamSegError::inference(
                "mask post-processing",
                format!("mask buffer does not match {}x{}", low_w, low_h),
            )
        })?;

    let padded = imageops::resize(&low, pad.width, pad.height, FilterType::Triangle);
    let cropped = imageops::crop_imm(
        &padded,
        0,
        0,
        reshaped.width.min(pad.width),
        reshaped.height.min(pad.height),
    )
    .to_image();
    let full = imageops::resize(
        &cropped,
        original.width,
        original.height,
        FilterType::Triangle,
    );

    Ok(Array2::from_shape_fn(
        (original.height as usize, original.width as usize),
        |(y, x)| full.get_pixel(x as u32, y as u32).0[0] > 0.0,
    ))
}

/// SAM split into its two exported graphs.
pub struct SamModel {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
}

impl SamModel {
    pub fn new(
        model_id: &str,
        encoder_path: &Path,
        decoder_path: &Path,
        backend: Backend,
        device_id: i32,
    ) -> Result<Self> {
        let encoder = build_session(model_id, "vision encoder", encoder_path, backend, device_id)?;
        let decoder = build_session(model_id, "mask decoder", decoder_path, backend, device_id)?;
        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
        })
    }
}

fn build_session(
    model_id: &str,
    component: &str,
    path: &Path,
    backend: Backend,
    device_id: i32,
) -> Result<Session> {
    let fail = |operation: &str, e: &dyn Display| {
        SamSegError::load(
            model_id,
            component,
            format!("{} ({}): {}", operation, path.display(), e),
        )
    };

    if !path.is_file() {
        return Err(SamSegError::load(
            model_id,
            component,
            SamSegError::FileSystem {
                path: path.to_path_buf(),
                operation: "open model file".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "model file not found"),
            },
        ));
    }

    let builder = Session::builder().map_err(|e| fail("session builder", &e))?;
    let builder = match backend {
        Backend::Cpu => builder,
        Backend::Cuda => builder
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure()])
            .map_err(|e| fail("CUDA execution provider", &e))?,
        Backend::Tensorrt => builder
            .with_execution_providers([TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure()])
            .map_err(|e| fail("TensorRT execution provider", &e))?,
        // 利用できないプロバイダーは無視され、CPUにフォールバックする
        Backend::Auto => builder
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| fail("execution providers", &e))?,
    };

    let session = builder
        .with_memory_pattern(true)
        .map_err(|e| fail("memory pattern", &e))?
        .commit_from_file(path)
        .map_err(|e| fail("model file", &e))?;

    tracing::debug!(component, path = %path.display(), ?backend, "session created");
    Ok(session)
}

impl PromptSegmentationModel for SamModel {
    fn embed(&self, inputs: &PreprocessedInputs) -> Result<Embeddings> {
        let mut session = self.encoder.lock();
        let outputs = session.run(ort::inputs![
            "pixel_values" => TensorRef::from_array_view(&inputs.pixel_values)?,
        ])?;

        let image_embeddings = outputs["image_embeddings"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        let positional_embeddings = outputs["image_positional_embeddings"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();

        Ok(Embeddings {
            image_embeddings,
            positional_embeddings,
        })
    }

    fn infer(&self, embeddings: &Embeddings, prompts: &PointPrompts) -> Result<MaskPrediction> {
        let mut session = self.decoder.lock();
        let outputs = session.run(ort::inputs![
            "image_embeddings" => TensorRef::from_array_view(&embeddings.image_embeddings)?,
            "image_positional_embeddings" => TensorRef::from_array_view(&embeddings.positional_embeddings)?,
            "input_points" => TensorRef::from_array_view(&prompts.coords)?,
            "input_labels" => TensorRef::from_array_view(&prompts.labels)?,
        ])?;

        // [1, point_batch, num_masks, h, w] / [1, point_batch, num_masks]
        let pred_masks = outputs["pred_masks"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix5>()?
            .index_axis_move(Axis(0), 0)
            .to_owned();
        let iou_scores = outputs["iou_scores"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?
            .index_axis_move(Axis(0), 0)
            .to_owned();

        Ok(MaskPrediction {
            pred_masks,
            iou_scores,
        })
    }
}

/// Loads the ONNX graphs and preprocessor settings described by [`Config`].
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    model_id: String,
    encoder_path: PathBuf,
    decoder_path: PathBuf,
    preprocessor_config_path: PathBuf,
    backend: Backend,
    device_id: i32,
}

impl OnnxModelLoader {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model_id: config.model_id.clone(),
            encoder_path: config.encoder_path(),
            decoder_path: config.decoder_path(),
            preprocessor_config_path: config.preprocessor_config_path(),
            backend: config.backend,
            device_id: config.device_id,
        }
    }
}

#[async_trait]
impl ModelLoader for OnnxModelLoader {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn load_model(&self) -> Result<Arc<dyn PromptSegmentationModel>> {
        let loader = self.clone();
        let model = tokio::task::spawn_blocking(move || {
            SamModel::new(
                &loader.model_id,
                &loader.encoder_path,
                &loader.decoder_path,
                loader.backend,
                loader.device_id,
            )
        })
        .await
        .map_err(|e| SamSegError::load(&self.model_id, "model", e))??;

        Ok(Arc::new(model))
    }

    async fn load_processor(&self) -> Result<Arc<dyn ImagePreprocessor>> {
        let path = &self.preprocessor_config_path;
        let settings = match tokio::fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str::<PreprocessorSettings>(&text)
                .map_err(|e| SamSegError::load(&self.model_id, "preprocessor", e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "preprocessor config not found, using SAM defaults"
                );
                PreprocessorSettings::default()
            }
            Err(e) => {
                return Err(SamSegError::load(
                    &self.model_id,
                    "preprocessor",
                    SamSegError::FileSystem {
                        path: path.clone(),
                        operation: "read preprocessor config".to_string(),
                        source: e,
                    },
                ))
            }
        };

        let processor = SamProcessor::new(settings)
            .map_err(|e| SamSegError::load(&self.model_id, "preprocessor", e))?;
        Ok(Arc::new(processor))
    }
}
