//! Interactive Segment Anything worker.
//!
//! An image is embedded once by the vision encoder (`segment`); point prompts
//! are then decoded against those embeddings as often as the host likes
//! (`decode`). Embeddings are cached by the SHA-256 digest of the pixel bytes.

pub mod cache;
pub mod config;
pub mod digest;
pub mod errors;
pub mod mask;
pub mod model;
pub mod protocol;
pub mod provider;
pub mod router;
pub mod session;
pub mod traits;
pub mod types;
pub mod worker;

pub mod mocks;

pub use cache::{CacheEntry, CacheStats, EmbeddingCache};
pub use config::Config;
pub use digest::{digest, ImageDigest};
pub use errors::{Result, SamSegError};
pub use model::{OnnxModelLoader, SamModel, SamProcessor};
pub use protocol::{
    DecodeResult, ImageSource, Notification, OutboundMessage, Request, RequestEnvelope,
    SegmentPhase,
};
pub use provider::{ModelProvider, ProviderStatus, SamHandles};
pub use router::RequestRouter;
pub use session::SessionState;
pub use traits::*;
pub use types::{Embeddings, ImageSize, MaskPrediction, PointPrompts, PreprocessedInputs, Prompt};
pub use worker::{SegmentationWorker, WorkerOptions};

#[cfg(test)]
pub use mocks::*;
