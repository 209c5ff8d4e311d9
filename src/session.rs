use std::sync::Arc;

use crate::cache::CacheEntry;

/// The image decode requests run against.
///
/// Holds a reference to a cache entry, so preprocessed inputs and embeddings are
/// always set and cleared as a pair.
#[derive(Debug, Default)]
pub struct SessionState {
    current: Option<Arc<CacheEntry>>,
}

impl SessionState {
    pub const fn new() -> Self {
        Self { current: None }
    }

    pub fn set(&mut self, entry: Arc<CacheEntry>) {
        self.current = Some(entry);
    }

    /// Idempotent.
    pub fn clear(&mut self) {
        self.current = None;
    }

    pub fn get(&self) -> Option<&Arc<CacheEntry>> {
        self.current.as_ref()
    }

    pub const fn is_empty(&self) -> bool {
        self.current.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest;
    use crate::types::{Embeddings, ImageSize, PreprocessedInputs};
    use ndarray::Array4;

    fn entry(tag: &[u8]) -> Arc<CacheEntry> {
        Arc::new(CacheEntry {
            digest: digest(tag),
            inputs: PreprocessedInputs {
                pixel_values: Array4::zeros((1, 3, 2, 2)),
                original_size: ImageSize::new(2, 2),
                reshaped_size: ImageSize::new(2, 2),
            },
            embeddings: Embeddings {
                image_embeddings: Array4::zeros((1, 1, 1, 1)),
                positional_embeddings: Array4::zeros((1, 1, 1, 1)),
            },
        })
    }

    #[test]
    fn test_starts_empty() {
        let session = SessionState::new();
        assert!(session.is_empty());
        assert!(session.get().is_none());
    }

    #[test]
    fn test_set_overwrites_previous_image() {
        let mut session = SessionState::new();
        let first = entry(b"first");
        let second = entry(b"second");

        session.set(Arc::clone(&first));
        session.set(Arc::clone(&second));

        assert!(Arc::ptr_eq(session.get().unwrap(), &second));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut session = SessionState::new();
        session.set(entry(b"image"));

        session.clear();
        session.clear();
        assert!(session.is_empty());
    }
}
