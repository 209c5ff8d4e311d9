//! Message envelopes exchanged between the host and the worker.
//!
//! Inbound: `{ "type": "reset" | "segment" | "decode", "data": ... }`.
//! Outbound: `ready`, `segment_result` (`start` / `done`), `decode_result` and
//! `error`.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};

use crate::errors::{BoxedSource, Result, SamSegError};
use crate::types::Prompt;

/// Raw inbound envelope. The kind is kept as a string so unknown kinds can be
/// reported by name instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RequestEnvelope {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn reset() -> Self {
        Self::new("reset", serde_json::Value::Null)
    }

    pub fn segment(source: &ImageSource) -> Self {
        let data = match source {
            ImageSource::Path(path) => serde_json::json!({ "path": path }),
            ImageSource::Bytes(bytes) => serde_json::json!({ "bytes": bytes }),
        };
        Self::new("segment", data)
    }

    pub fn decode(prompts: &[Prompt]) -> Self {
        Self::new("decode", serde_json::json!(prompts))
    }

    pub fn from_json_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Reset,
    Segment(ImageSource),
    Decode(Vec<Prompt>),
}

impl Request {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Segment(_) => "segment",
            Self::Decode(_) => "decode",
        }
    }
}

impl TryFrom<RequestEnvelope> for Request {
    type Error = SamSegError;

    fn try_from(envelope: RequestEnvelope) -> Result<Self> {
        let invalid = |reason: serde_json::Error| SamSegError::InvalidRequest {
            kind: envelope.kind.clone(),
            reason: reason.to_string(),
        };

        match envelope.kind.as_str() {
            "reset" => Ok(Self::Reset),
            "segment" => serde_json::from_value(envelope.data.clone())
                .map(Self::Segment)
                .map_err(invalid),
            "decode" => serde_json::from_value(envelope.data.clone())
                .map(Self::Decode)
                .map_err(invalid),
            other => Err(SamSegError::UnknownRequest {
                kind: other.to_string(),
            }),
        }
    }
}

/// Where the bytes of a `segment` image come from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "ImageSourceRepr")]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageSourceRepr {
    Path(PathBuf),
    File { path: PathBuf },
    Bytes { bytes: Vec<u8> },
}

impl From<ImageSourceRepr> for ImageSource {
    fn from(repr: ImageSourceRepr) -> Self {
        match repr {
            ImageSourceRepr::Path(path) | ImageSourceRepr::File { path } => Self::Path(path),
            ImageSourceRepr::Bytes { bytes } => Self::Bytes(bytes),
        }
    }
}

impl ImageSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }

    /// Decodes the image into 8-bit RGB pixels.
    pub fn decode(&self) -> Result<RgbImage> {
        let decoded: std::result::Result<DynamicImage, BoxedSource> = match self {
            Self::Path(path) => ImageReader::open(path)
                .and_then(|r| r.with_guessed_format())
                .map_err(BoxedSource::from)
                .and_then(|r| r.decode().map_err(BoxedSource::from)),
            Self::Bytes(bytes) => ImageReader::new(Cursor::new(bytes.as_slice()))
                .with_guessed_format()
                .map_err(BoxedSource::from)
                .and_then(|r| r.decode().map_err(BoxedSource::from)),
        };

        decoded
            .map(DynamicImage::into_rgb8)
            .map_err(|e| SamSegError::decode_image(self.describe(), e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentPhase {
    Start,
    Done,
}

#[derive(Debug, Clone)]
pub struct DecodeResult {
    /// One channel per candidate mask, at the original image resolution.
    pub mask: DynamicImage,
    /// Predicted IoU per candidate mask.
    pub scores: Vec<f32>,
}

/// Worker → host notification.
#[derive(Debug, Clone)]
pub enum Notification {
    Ready,
    SegmentResult(SegmentPhase),
    DecodeResult(DecodeResult),
    Error { request: String, message: String },
}

impl Notification {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::SegmentResult(_) => "segment_result",
            Self::DecodeResult(_) => "decode_result",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(request: impl Into<String>, err: &SamSegError) -> Self {
        Self::Error {
            request: request.into(),
            message: err.to_string(),
        }
    }
}

/// Serialized form written by the host. Masks are referenced by file path.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage<'a> {
    Ready,
    SegmentResult(SegmentPhase),
    DecodeResult { mask: &'a Path, scores: &'a [f32] },
    Error { request: &'a str, message: &'a str },
}

impl OutboundMessage<'_> {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::SegmentResult(_) => "segment_result",
            Self::DecodeResult { .. } => "decode_result",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|source| SamSegError::EncodeMessage {
            message_type: self.kind().to_string(),
            source,
        })
    }
}
