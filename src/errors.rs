use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Shared error source, handed out to every caller waiting on the same attempt.
pub type SharedSource = Arc<dyn std::error::Error + Send + Sync>;

/// Boxed error source for failures owned by a single request.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the segmentation worker.
///
/// One variant per failure class the host can react to: a failed load is retried
/// by the next request, a precondition error means no image has been segmented.
#[derive(Error, Debug)]
pub enum SamSegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model load error: {model_id} ({component}) could not be loaded")]
    Load {
        model_id: String,
        component: String,
        #[source]
        source: SharedSource,
    },

    #[error("Image decode error: {source_name} could not be read")]
    DecodeImage {
        source_name: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Precondition failed: {reason}")]
    Precondition { reason: String },

    #[error("Unknown message type: {kind}")]
    UnknownRequest { kind: String },

    #[error("Invalid {kind} request: {reason}")]
    InvalidRequest { kind: String, reason: String },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Request timed out after {limit:?}")]
    Timeout { limit: std::time::Duration },

    #[error("Failed to encode {message_type} message")]
    EncodeMessage {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Worker stopped: {reason}")]
    WorkerStopped { reason: String },
}

pub type Result<T> = std::result::Result<T, SamSegError>;

impl SamSegError {
    pub fn inference(operation: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Inference {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn decode_image(source_name: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::DecodeImage {
            source_name: source_name.into(),
            source: source.into(),
        }
    }

    pub fn load(
        model_id: impl Into<String>,
        component: impl Into<String>,
        source: impl Into<BoxedSource>,
    ) -> Self {
        let boxed: BoxedSource = source.into();
        Self::Load {
            model_id: model_id.into(),
            component: component.into(),
            source: Arc::from(boxed),
        }
    }

    /// Duplicates a load failure so it can be reported to more than one waiter.
    ///
    /// Returns `None` for every other variant; those are owned by exactly one request.
    pub fn share_load_failure(&self) -> Option<Self> {
        match self {
            Self::Load {
                model_id,
                component,
                source,
            } => Some(Self::Load {
                model_id: model_id.clone(),
                component: component.clone(),
                source: Arc::clone(source),
            }),
            _ => None,
        }
    }
}

/// Convert ONNX Runtime errors to inference errors.
///
/// Load paths wrap ort errors in `Load` explicitly, so anything reaching this
/// conversion happened while running a session.
impl From<ort::Error> for SamSegError {
    fn from(err: ort::Error) -> Self {
        Self::inference("ort operation", err)
    }
}

/// Shape errors only occur while packing or unpacking model tensors.
impl From<ndarray::ShapeError> for SamSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::inference("tensor shape conversion", err)
    }
}

impl From<serde_json::Error> for SamSegError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest {
            kind: "envelope".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_failure_is_shared() {
        let err = SamSegError::load(
            "Xenova/slimsam-77-uniform",
            "vision encoder",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );

        let copy = err.share_load_failure().unwrap();
        match (&err, &copy) {
            (SamSegError::Load { source: a, .. }, SamSegError::Load { source: b, .. }) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("Expected Load errors"),
        }
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn test_only_load_failures_are_shared() {
        let err = SamSegError::Precondition {
            reason: "no image".to_string(),
        };
        assert!(err.share_load_failure().is_none());
    }

    #[test]
    fn test_decode_image_keeps_source_name() {
        let err = SamSegError::decode_image("cat.png", "truncated stream");
        assert_eq!(err.to_string(), "Image decode error: cat.png could not be read");
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("truncated stream".to_string())
        );
    }

    #[test]
    fn test_encode_failure_is_not_a_request_error() {
        let err = SamSegError::EncodeMessage {
            message_type: "decode_result".to_string(),
            source: serde_json::from_str::<u8>("x").unwrap_err(),
        };
        assert_eq!(err.to_string(), "Failed to encode decode_result message");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_unknown_request_message_names_kind() {
        let err = SamSegError::UnknownRequest {
            kind: "bogus".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown message type: bogus");
    }
}
