//! Embedding cache keyed by image content.
//!
//! The encoder is by far the most expensive call, so its output is kept per
//! [`ImageDigest`] for the lifetime of the process. The cache is unbounded
//! unless a capacity is configured, in which case least recently used entries
//! are evicted first.
//!
//! Two concurrent misses for the same new image both compute; the later insert
//! replaces the earlier one. Both results are equivalent, so the race only costs
//! time.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::RgbImage;
use lru::LruCache;
use parking_lot::Mutex;

use crate::digest::{digest, ImageDigest};
use crate::errors::{Result, SamSegError};
use crate::provider::SamHandles;
use crate::types::{Embeddings, PreprocessedInputs};

/// One computed embedding. Never mutated after insertion.
#[derive(Debug)]
pub struct CacheEntry {
    pub digest: ImageDigest,
    pub inputs: PreprocessedInputs,
    pub embeddings: Embeddings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct EmbeddingCache {
    entries: Mutex<LruCache<ImageDigest, Arc<CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Unbounded cache; entries live until the process exits.
    pub fn new() -> Self {
        Self::from_lru(LruCache::unbounded())
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self::from_lru(LruCache::new(capacity))
    }

    pub fn from_capacity(capacity: Option<NonZeroUsize>) -> Self {
        capacity.map_or_else(Self::new, Self::with_capacity)
    }

    fn from_lru(entries: LruCache<ImageDigest, Arc<CacheEntry>>) -> Self {
        Self {
            entries: Mutex::new(entries),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached entry for `image`, computing and storing it on a miss.
    ///
    /// Nothing is inserted unless both the preprocessor and the encoder succeed.
    pub async fn get_or_compute(
        &self,
        image: Arc<RgbImage>,
        handles: &SamHandles,
    ) -> Result<Arc<CacheEntry>> {
        let image_digest = {
            let image = Arc::clone(&image);
            tokio::task::spawn_blocking(move || digest(image.as_raw()))
                .await
                .map_err(|e| SamSegError::inference("image digest", e))?
        };

        if let Some(entry) = self.get(&image_digest) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(digest = image_digest.short(), "embedding cache hit");
            return Ok(entry);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(digest = image_digest.short(), "embedding cache miss, computing");

        let handles = handles.clone();
        let (inputs, embeddings) = tokio::task::spawn_blocking(move || {
            let inputs = handles.processor.process(&image)?;
            let embeddings = handles.model.embed(&inputs)?;
            Ok::<_, SamSegError>((inputs, embeddings))
        })
        .await
        .map_err(|e| SamSegError::inference("image embedding", e))??;

        let entry = Arc::new(CacheEntry {
            digest: image_digest.clone(),
            inputs,
            embeddings,
        });
        self.entries.lock().put(image_digest, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, image_digest: &ImageDigest) -> Option<Arc<CacheEntry>> {
        self.entries.lock().get(image_digest).cloned()
    }

    pub fn contains(&self, image_digest: &ImageDigest) -> bool {
        self.entries.lock().contains(image_digest)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockCounters, MockModel, MockProcessor};
    use image::Rgb;

    fn mock_handles() -> (SamHandles, Arc<MockCounters>) {
        let counters = Arc::new(MockCounters::default());
        let handles = SamHandles {
            model: Arc::new(MockModel::new(Arc::clone(&counters))),
            processor: Arc::new(MockProcessor::new(Arc::clone(&counters))),
        };
        (handles, counters)
    }

    fn solid(width: u32, height: u32, value: u8) -> Arc<RgbImage> {
        Arc::new(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
    }

    #[tokio::test]
    async fn test_second_request_is_a_hit() -> Result<()> {
        let (handles, counters) = mock_handles();
        let cache = EmbeddingCache::new();

        let first = cache.get_or_compute(solid(32, 16, 10), &handles).await?;
        let second = cache.get_or_compute(solid(32, 16, 10), &handles).await?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counters.process_calls(), 1);
        assert_eq!(counters.embed_calls(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_distinct_images_get_distinct_entries() -> Result<()> {
        let (handles, counters) = mock_handles();
        let cache = EmbeddingCache::new();

        let a = cache.get_or_compute(solid(8, 8, 1), &handles).await?;
        let b = cache.get_or_compute(solid(8, 8, 2), &handles).await?;

        assert_ne!(a.digest, b.digest);
        assert_eq!(counters.embed_calls(), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&a.digest) && cache.contains(&b.digest));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_embedding_is_not_cached() {
        let counters = Arc::new(MockCounters::default());
        let loader = crate::mocks::MockLoader::new().failing_embedding();
        let model = {
            use crate::traits::ModelLoader;
            loader.load_model().await.unwrap()
        };
        let handles = SamHandles {
            model,
            processor: Arc::new(MockProcessor::new(counters)),
        };
        let cache = EmbeddingCache::new();

        let result = cache.get_or_compute(solid(8, 8, 3), &handles).await;
        assert!(matches!(result, Err(SamSegError::Inference { .. })));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_bounded_cache_evicts_least_recently_used() -> Result<()> {
        let (handles, counters) = mock_handles();
        let cache = EmbeddingCache::with_capacity(NonZeroUsize::new(2).unwrap());

        let a = cache.get_or_compute(solid(4, 4, 1), &handles).await?;
        let b = cache.get_or_compute(solid(4, 4, 2), &handles).await?;
        // aを再利用して最近使用にする
        cache.get_or_compute(solid(4, 4, 1), &handles).await?;
        let c = cache.get_or_compute(solid(4, 4, 3), &handles).await?;

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&a.digest));
        assert!(!cache.contains(&b.digest));
        assert!(cache.contains(&c.digest));
        assert_eq!(counters.embed_calls(), 3);
        Ok(())
    }
}
