use clap::{Parser, ValueEnum};
use image::ImageFormat;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL_ID: &str = "Xenova/slimsam-77-uniform";

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Directory holding one sub-directory per model id.
    #[arg(long, default_value = "models")]
    pub model_root: PathBuf,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(short, long, value_enum, default_value_t = Precision::Fp16)]
    pub precision: Precision,

    #[arg(short, long, value_enum, default_value_t = Backend::Auto)]
    pub backend: Backend,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long, default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    /// Upper bound on cached embeddings; unbounded when omitted.
    #[arg(long)]
    pub cache_capacity: Option<NonZeroUsize>,

    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub inbox_capacity: u64,
}

/// Weight precision of the exported ONNX graphs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    Fp32,
    Fp16,
    Quantized,
}

impl Precision {
    /// File name suffix used by the exported model files.
    pub const fn file_suffix(&self) -> &'static str {
        match self {
            Self::Fp32 => "",
            Self::Fp16 => "_fp16",
            Self::Quantized => "_quantized",
        }
    }
}

/// Execution provider selection. `Auto` tries TensorRT, then CUDA, then falls back to CPU.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Auto,
    Cpu,
    Cuda,
    Tensorrt,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_root: PathBuf::from("models"),
            model_id: DEFAULT_MODEL_ID.to_string(),
            precision: Precision::Fp16,
            backend: Backend::Auto,
            device_id: 0,
            output_dir: PathBuf::from("output"),
            format: "png".to_string(),
            cache_capacity: None,
            request_timeout_secs: None,
            inbox_capacity: 1,
        }
    }
}

impl Config {
    pub fn model_dir(&self) -> PathBuf {
        self.model_root.join(&self.model_id)
    }

    pub fn encoder_path(&self) -> PathBuf {
        self.model_dir().join("onnx").join(format!(
            "vision_encoder{}.onnx",
            self.precision.file_suffix()
        ))
    }

    pub fn decoder_path(&self) -> PathBuf {
        self.model_dir().join("onnx").join(format!(
            "prompt_encoder_mask_decoder{}.onnx",
            self.precision.file_suffix()
        ))
    }

    pub fn preprocessor_config_path(&self) -> PathBuf {
        self.model_dir().join("preprocessor_config.json")
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::from_extension(&self.format).unwrap_or(ImageFormat::Png)
    }
}

fn check_format(s: &str) -> Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
