use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 of decoded pixel data, rendered as 64 lowercase hex characters.
///
/// Used as the embedding cache key: equal pixel bytes always produce the same digest,
/// across calls and across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageDigest(String);

impl ImageDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the content digest of a raw byte sequence.
pub fn digest(bytes: &[u8]) -> ImageDigest {
    ImageDigest(hex::encode(Sha256::digest(bytes)))
}
