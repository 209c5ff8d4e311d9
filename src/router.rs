use std::sync::Arc;
use std::time::Duration;

use ndarray::s;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::EmbeddingCache;
use crate::errors::{Result, SamSegError};
use crate::mask::masks_to_image;
use crate::protocol::{
    DecodeResult, ImageSource, Notification, Request, RequestEnvelope, SegmentPhase,
};
use crate::provider::{ModelProvider, SamHandles};
use crate::session::SessionState;
use crate::traits::ModelLoader;
use crate::types::{PointPrompts, Prompt};

/// Routes requests to the reset/segment/decode handlers and emits notifications.
///
/// Requests are expected one at a time: the caller waits for
/// `segment_result: done` before decoding, and for `decode_result` before
/// segmenting another image. Nothing here cancels an in-flight request.
pub struct RequestRouter<L: ModelLoader> {
    provider: ModelProvider<L>,
    cache: EmbeddingCache,
    session: SessionState,
    ready: bool,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl<L: ModelLoader + 'static> RequestRouter<L> {
    pub fn new(
        provider: ModelProvider<L>,
        cache: EmbeddingCache,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            provider,
            cache,
            session: SessionState::new(),
            ready: false,
            notifications,
        }
    }

    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    pub const fn session(&self) -> &SessionState {
        &self.session
    }

    pub const fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub const fn provider(&self) -> &ModelProvider<L> {
        &self.provider
    }

    /// Handles one envelope and reports any failure as an `error` notification.
    pub async fn dispatch(
        &mut self,
        envelope: RequestEnvelope,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let kind = envelope.kind.clone();
        let span = tracing::info_span!("request", id = %Uuid::new_v4(), kind = %kind);

        let outcome = async {
            let started = std::time::Instant::now();
            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, self.handle(envelope))
                    .await
                    .unwrap_or(Err(SamSegError::Timeout { limit })),
                None => self.handle(envelope).await,
            };
            match &outcome {
                Ok(()) => tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request completed"
                ),
                Err(e) => tracing::warn!(error = %e, "request failed"),
            }
            outcome
        }
        .instrument(span)
        .await;

        if let Err(e) = &outcome {
            self.emit(Notification::error(kind, e));
        }
        outcome
    }

    /// Handles one envelope. Unknown or malformed requests fail before the
    /// model is touched.
    pub async fn handle(&mut self, envelope: RequestEnvelope) -> Result<()> {
        let request = Request::try_from(envelope)?;
        let handles = self.ensure_ready().await?;

        match request {
            Request::Reset => {
                self.session.clear();
                tracing::debug!("session cleared");
                Ok(())
            }
            Request::Segment(source) => self.segment(&handles, source).await,
            Request::Decode(prompts) => self.decode(&handles, &prompts).await,
        }
    }

    async fn ensure_ready(&mut self) -> Result<SamHandles> {
        let handles = self.provider.get_instance().await?;
        if !self.ready {
            self.ready = true;
            tracing::info!(model_id = self.provider.model_id(), "worker ready");
            self.emit(Notification::Ready);
        }
        Ok(handles)
    }

    async fn segment(&mut self, handles: &SamHandles, source: ImageSource) -> Result<()> {
        self.emit(Notification::SegmentResult(SegmentPhase::Start));

        let image = tokio::task::spawn_blocking(move || source.decode())
            .await
            .map_err(|e| SamSegError::inference("image decoding", e))??;
        let (width, height) = image.dimensions();

        let entry = self.cache.get_or_compute(Arc::new(image), handles).await?;
        tracing::info!(
            digest = entry.digest.short(),
            width,
            height,
            cached = self.cache.len(),
            "image embeddings ready"
        );
        self.session.set(entry);

        self.emit(Notification::SegmentResult(SegmentPhase::Done));
        Ok(())
    }

    async fn decode(&mut self, handles: &SamHandles, prompts: &[Prompt]) -> Result<()> {
        let entry = self
            .session
            .get()
            .cloned()
            .ok_or_else(|| SamSegError::Precondition {
                reason: "decode requested before any image was segmented".to_string(),
            })?;

        let points = PointPrompts::from_prompts(prompts, entry.inputs.reshaped_size)?;
        tracing::debug!(points = points.len(), "decoding prompts");

        let handles = handles.clone();
        let result = tokio::task::spawn_blocking(move || {
            let prediction = handles.model.infer(&entry.embeddings, &points)?;
            let masks = handles.processor.post_process_masks(
                prediction.pred_masks.view(),
                entry.inputs.original_size,
                entry.inputs.reshaped_size,
            )?;
            if masks.shape()[0] == 0 {
                return Err(SamSegError::inference(
                    "mask decoder",
                    "decoder returned no masks",
                ));
            }

            Ok(DecodeResult {
                mask: masks_to_image(masks.slice(s![0, .., .., ..]))?,
                scores: prediction.scores(),
            })
        })
        .await
        .map_err(|e| SamSegError::inference("mask decoding", e))??;

        self.emit(Notification::DecodeResult(result));
        Ok(())
    }

    fn emit(&self, notification: Notification) {
        let kind = notification.kind();
        if self.notifications.send(notification).is_err() {
            tracing::debug!(kind, "notification dropped, receiver is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockLoader, MOCK_SCORES};
    use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn router(loader: MockLoader) -> (RequestRouter<MockLoader>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = RequestRouter::new(ModelProvider::new(loader), EmbeddingCache::new(), tx);
        (router, rx)
    }

    fn png(width: u32, height: u32, value: u8) -> ImageSource {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value; 3])));
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        ImageSource::Bytes(buf)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn kinds(notifications: &[Notification]) -> Vec<&'static str> {
        notifications.iter().map(Notification::kind).collect()
    }

    #[tokio::test]
    async fn test_ready_is_emitted_once_before_results() -> Result<()> {
        let (mut router, mut rx) = router(MockLoader::new());

        router.handle(RequestEnvelope::segment(&png(20, 10, 1))).await?;
        router
            .handle(RequestEnvelope::decode(&[Prompt::foreground(0.5, 0.5)]))
            .await?;
        router.handle(RequestEnvelope::reset()).await?;

        let notifications = drain(&mut rx);
        assert_eq!(
            kinds(&notifications),
            vec!["ready", "segment_result", "segment_result", "decode_result"]
        );
        assert!(router.is_ready());
        Ok(())
    }

    #[tokio::test]
    async fn test_segment_is_bracketed() -> Result<()> {
        let (mut router, mut rx) = router(MockLoader::new());
        router.handle(RequestEnvelope::segment(&png(8, 8, 1))).await?;

        let notifications = drain(&mut rx);
        assert!(matches!(
            notifications.as_slice(),
            [
                Notification::Ready,
                Notification::SegmentResult(SegmentPhase::Start),
                Notification::SegmentResult(SegmentPhase::Done)
            ]
        ));
        assert!(!router.session().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_same_image_is_embedded_once() -> Result<()> {
        let loader = MockLoader::new();
        let counters = loader.counters();
        let (mut router, _rx) = router(loader);

        router.handle(RequestEnvelope::segment(&png(16, 16, 7))).await?;
        let first = Arc::clone(router.session().get().unwrap());
        router.handle(RequestEnvelope::segment(&png(16, 16, 7))).await?;
        let second = Arc::clone(router.session().get().unwrap());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counters.embed_calls(), 1);
        assert_eq!(counters.process_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_decode_after_reset_is_precondition_error() -> Result<()> {
        let loader = MockLoader::new();
        let counters = loader.counters();
        let (mut router, _rx) = router(loader);

        router.handle(RequestEnvelope::segment(&png(8, 8, 1))).await?;
        router.handle(RequestEnvelope::reset()).await?;
        let result = router
            .handle(RequestEnvelope::decode(&[Prompt::foreground(0.5, 0.5)]))
            .await;

        assert!(matches!(result, Err(SamSegError::Precondition { .. })));
        assert_eq!(counters.infer_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_decode_result_contents() -> Result<()> {
        let loader = MockLoader::new();
        let counters = loader.counters();
        let (mut router, mut rx) = router(loader);

        // 40x20 → モック入力サイズ64で reshaped = (32, 64)
        router.handle(RequestEnvelope::segment(&png(40, 20, 3))).await?;
        let prompts = [Prompt::foreground(0.5, 0.25), Prompt::background(0.1, 0.9)];
        router.handle(RequestEnvelope::decode(&prompts)).await?;

        let sent = counters.last_prompts().unwrap();
        assert_eq!(sent.coords[[0, 0, 0, 0]], 32.0);
        assert_eq!(sent.coords[[0, 0, 0, 1]], 8.0);
        assert_eq!(sent.labels[[0, 0, 1]], 0);

        match drain(&mut rx).pop() {
            Some(Notification::DecodeResult(result)) => {
                assert_eq!(result.scores, MOCK_SCORES.to_vec());
                assert_eq!(result.mask.dimensions(), (40, 20));
                let rgb = result.mask.to_rgb8();
                assert_eq!(rgb.get_pixel(0, 0).0, [255, 255, 0]);
                assert_eq!(rgb.get_pixel(39, 19).0, [255, 0, 0]);
            }
            other => panic!("Expected decode_result, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_kind_has_no_side_effects() {
        let loader = MockLoader::new();
        let counters = loader.counters();
        let (mut router, mut rx) = router(loader);

        let result = router
            .dispatch(RequestEnvelope::new("bogus", serde_json::Value::Null), None)
            .await;

        assert!(matches!(result, Err(SamSegError::UnknownRequest { .. })));
        let notifications = drain(&mut rx);
        assert_eq!(kinds(&notifications), vec!["error"]);
        assert_eq!(counters.model_loads(), 0);
        assert!(!router.is_ready());
    }

    #[tokio::test]
    async fn test_bad_image_leaves_session_unchanged() -> Result<()> {
        let (mut router, mut rx) = router(MockLoader::new());
        router.handle(RequestEnvelope::segment(&png(8, 8, 1))).await?;
        let before = Arc::clone(router.session().get().unwrap());
        drain(&mut rx);

        let result = router
            .dispatch(
                RequestEnvelope::segment(&ImageSource::Bytes(b"garbage".to_vec())),
                None,
            )
            .await;

        assert!(matches!(result, Err(SamSegError::DecodeImage { .. })));
        assert!(Arc::ptr_eq(router.session().get().unwrap(), &before));
        assert_eq!(router.cache().len(), 1);
        // start の後に必ずエラーが通知される
        assert_eq!(kinds(&drain(&mut rx)), vec!["segment_result", "error"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_inference_failure_is_reported() -> Result<()> {
        let (mut router, mut rx) = router(MockLoader::new().failing_inference());
        router.handle(RequestEnvelope::segment(&png(8, 8, 1))).await?;
        drain(&mut rx);

        let result = router
            .dispatch(RequestEnvelope::decode(&[Prompt::foreground(0.5, 0.5)]), None)
            .await;

        assert!(matches!(result, Err(SamSegError::Inference { .. })));
        match drain(&mut rx).as_slice() {
            [Notification::Error { request, .. }] => assert_eq!(request, "decode"),
            other => panic!("Expected one error, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_load_failure_then_retry() -> Result<()> {
        let (mut router, mut rx) = router(MockLoader::new().failing_loads(1));

        let first = router.dispatch(RequestEnvelope::reset(), None).await;
        assert!(matches!(first, Err(SamSegError::Load { .. })));
        assert!(!router.is_ready());

        router.dispatch(RequestEnvelope::reset(), None).await?;
        assert_eq!(kinds(&drain(&mut rx)), vec!["error", "ready"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_timed_out_segment_commits_nothing() -> Result<()> {
        let loader = MockLoader::new().with_embed_delay(Duration::from_millis(150));
        let counters = loader.counters();
        let (mut router, mut rx) = router(loader);

        router.dispatch(RequestEnvelope::segment(&png(8, 8, 1)), None).await?;
        let before = Arc::clone(router.session().get().unwrap());
        drain(&mut rx);

        let result = router
            .dispatch(
                RequestEnvelope::segment(&png(8, 8, 2)),
                Some(Duration::from_millis(20)),
            )
            .await;
        assert!(matches!(result, Err(SamSegError::Timeout { .. })));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [
                Notification::SegmentResult(SegmentPhase::Start),
                Notification::Error { .. }
            ]
        ));

        // 打ち切られた埋め込み計算が終わった後も何も書き込まれない
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counters.embed_calls(), 2);
        assert!(Arc::ptr_eq(router.session().get().unwrap(), &before));
        assert_eq!(router.cache().len(), 1);
        assert!(drain(&mut rx).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let loader = MockLoader::new().with_load_delay(Duration::from_millis(200));
        let (mut router, mut rx) = router(loader);

        let result = router
            .dispatch(RequestEnvelope::reset(), Some(Duration::from_millis(10)))
            .await;

        assert!(matches!(result, Err(SamSegError::Timeout { .. })));
        assert_eq!(kinds(&drain(&mut rx)), vec!["error"]);
    }
}
