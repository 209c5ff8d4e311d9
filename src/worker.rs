use std::num::NonZeroUsize;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::errors::{Result, SamSegError};
use crate::protocol::{Notification, RequestEnvelope};
use crate::provider::ModelProvider;
use crate::router::RequestRouter;
use crate::traits::ModelLoader;

/// Settings for the worker task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    pub inbox_capacity: usize,
    pub request_timeout: Option<Duration>,
    pub cache_capacity: Option<NonZeroUsize>,
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inbox_capacity: usize::try_from(config.inbox_capacity)
                .unwrap_or(usize::MAX)
                .max(1),
            request_timeout: config.request_timeout(),
            cache_capacity: config.cache_capacity,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub const fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            inbox_capacity: 1,
            request_timeout: None,
            cache_capacity: None,
        }
    }
}

/// Runs a [`RequestRouter`] on its own task.
///
/// Requests are handled strictly in arrival order, one at a time. Every
/// notification, including errors, arrives on the stream returned by
/// [`SegmentationWorker::spawn`].
pub struct SegmentationWorker {
    requests: mpsc::Sender<RequestEnvelope>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl SegmentationWorker {
    pub fn spawn<L: ModelLoader + 'static>(
        loader: L,
        options: WorkerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let router = RequestRouter::new(
            ModelProvider::new(loader),
            EmbeddingCache::from_capacity(options.cache_capacity),
            notify_tx,
        );
        (Self::with_router(router, &options), notify_rx)
    }

    /// Starts the loop around an existing router. The router keeps its own
    /// notification sender.
    pub fn with_router<L: ModelLoader + 'static>(
        router: RequestRouter<L>,
        options: &WorkerOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.inbox_capacity.max(1));
        let tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        tracker.spawn(Self::process_requests_loop(
            router,
            rx,
            options.request_timeout,
            cancellation_token.clone(),
        ));

        Self {
            requests: tx,
            tracker,
            cancellation_token,
        }
    }

    async fn process_requests_loop<L: ModelLoader + 'static>(
        mut router: RequestRouter<L>,
        mut inbox: mpsc::Receiver<RequestEnvelope>,
        request_timeout: Option<Duration>,
        cancellation_token: CancellationToken,
    ) {
        tracing::debug!("worker loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    break;
                }
                next = inbox.recv() => {
                    let Some(envelope) = next else {
                        break;
                    };
                    // 失敗はエラー通知として送信済み
                    let _ = router.dispatch(envelope, request_timeout).await;
                }
            }
        }
        tracing::debug!("worker loop stopped");
    }

    /// Queues a request, waiting while the inbox is full.
    pub async fn send(&self, envelope: RequestEnvelope) -> Result<()> {
        self.requests
            .send(envelope)
            .await
            .map_err(|_| SamSegError::WorkerStopped {
                reason: "request inbox is closed".to_string(),
            })
    }

    /// Queues a request without waiting. Fails when the inbox is full.
    pub fn try_send(&self, envelope: RequestEnvelope) -> Result<()> {
        self.requests.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(envelope) => SamSegError::InvalidRequest {
                kind: envelope.kind,
                reason: "worker inbox is full".to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => SamSegError::WorkerStopped {
                reason: "request inbox is closed".to_string(),
            },
        })
    }

    pub fn sender(&self) -> mpsc::Sender<RequestEnvelope> {
        self.requests.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }

    /// Lets queued requests finish, then stops.
    pub async fn join(self) {
        let Self {
            requests, tracker, ..
        } = self;
        drop(requests);
        tracker.close();
        tracker.wait().await;
    }

    /// Stops after the request in progress; queued requests are dropped.
    pub async fn shutdown(self) {
        self.tracker.close();
        self.cancellation_token.cancel();
        self.tracker.wait().await;
    }
}
