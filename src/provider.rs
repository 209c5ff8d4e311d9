//! Lazily loaded, shared model handles.
//!
//! ```text
//! NotLoaded --get_instance--> Loading --ok--> Loaded
//!                               |
//!                               +--err--> Failed --get_instance--> Loading
//! ```
//!
//! Every caller that arrives while an attempt is in flight waits on that same
//! attempt and receives its outcome. A failed attempt is remembered only until
//! the next call, which starts a fresh load.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::errors::{Result, SamSegError};
use crate::traits::{ImagePreprocessor, ModelLoader, PromptSegmentationModel};

/// The model and its preprocessor, loaded together.
#[derive(Clone)]
pub struct SamHandles {
    pub model: Arc<dyn PromptSegmentationModel>,
    pub processor: Arc<dyn ImagePreprocessor>,
}

type LoadOutcome = Option<Result<SamHandles>>;

enum ProviderState {
    NotLoaded,
    Loading(watch::Receiver<LoadOutcome>),
    Loaded(SamHandles),
    Failed(SamSegError),
}

/// Observable summary of the provider state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    NotLoaded,
    Loading,
    Loaded,
    Failed { message: String },
}

pub struct ModelProvider<L: ModelLoader> {
    loader: Arc<L>,
    state: Arc<Mutex<ProviderState>>,
}

impl<L: ModelLoader + 'static> ModelProvider<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
            state: Arc::new(Mutex::new(ProviderState::NotLoaded)),
        }
    }

    pub fn model_id(&self) -> &str {
        self.loader.model_id()
    }

    pub fn status(&self) -> ProviderStatus {
        match &*self.state.lock() {
            ProviderState::NotLoaded => ProviderStatus::NotLoaded,
            ProviderState::Loading(_) => ProviderStatus::Loading,
            ProviderState::Loaded(_) => ProviderStatus::Loaded,
            ProviderState::Failed(err) => ProviderStatus::Failed {
                message: err.to_string(),
            },
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(&*self.state.lock(), ProviderState::Loaded(_))
    }

    /// Returns the shared handles, loading them on first use.
    ///
    /// Concurrent callers during an in-flight load all resolve to the outcome of
    /// that single load.
    pub async fn get_instance(&self) -> Result<SamHandles> {
        let mut rx = {
            let mut state = self.state.lock();
            match &*state {
                ProviderState::Loaded(handles) => return Ok(handles.clone()),
                ProviderState::Loading(rx) => rx.clone(),
                ProviderState::NotLoaded | ProviderState::Failed(_) => {
                    if let ProviderState::Failed(err) = &*state {
                        tracing::info!(error = %err, "retrying model load after previous failure");
                    }
                    let rx = self.start_loading();
                    *state = ProviderState::Loading(rx.clone());
                    rx
                }
            }
        };

        if rx.wait_for(Option::is_some).await.is_err() {
            self.reset_abandoned(&rx);
            return Err(self.aborted_error());
        }

        let outcome = rx.borrow();
        match &*outcome {
            Some(Ok(handles)) => Ok(handles.clone()),
            Some(Err(err)) => Err(err
                .share_load_failure()
                .unwrap_or_else(|| SamSegError::load(self.model_id(), "model", err.to_string()))),
            None => Err(self.aborted_error()),
        }
    }

    fn start_loading(&self) -> watch::Receiver<LoadOutcome> {
        let (tx, rx) = watch::channel(None);
        let loader = Arc::clone(&self.loader);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let outcome = load_handles(loader.as_ref()).await;
            {
                let mut guard = state.lock();
                *guard = match &outcome {
                    Ok(handles) => ProviderState::Loaded(handles.clone()),
                    Err(err) => ProviderState::Failed(
                        err.share_load_failure()
                            .unwrap_or_else(|| SamSegError::load(loader.model_id(), "model", err.to_string())),
                    ),
                };
            }
            tx.send_replace(Some(outcome));
        });

        rx
    }

    /// The loader task went away without reporting; let the next call start over.
    fn reset_abandoned(&self, rx: &watch::Receiver<LoadOutcome>) {
        let mut state = self.state.lock();
        if matches!(&*state, ProviderState::Loading(current) if current.same_channel(rx)) {
            *state = ProviderState::NotLoaded;
        }
    }

    fn aborted_error(&self) -> SamSegError {
        SamSegError::load(
            self.model_id(),
            "model",
            "loader task ended without a result",
        )
    }
}

async fn load_handles<L: ModelLoader + ?Sized>(loader: &L) -> Result<SamHandles> {
    let model_id = loader.model_id().to_string();
    tracing::info!(model_id = %model_id, "loading model and preprocessor");
    let started = Instant::now();

    let (model, processor) = tokio::try_join!(
        async {
            loader
                .load_model()
                .await
                .map_err(|e| into_load_error(&model_id, "model", e))
        },
        async {
            loader
                .load_processor()
                .await
                .map_err(|e| into_load_error(&model_id, "preprocessor", e))
        },
    )
    .inspect_err(|e| tracing::error!(model_id = %model_id, error = %e, "model load failed"))?;

    tracing::info!(
        model_id = %model_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "model and preprocessor loaded"
    );
    Ok(SamHandles { model, processor })
}

fn into_load_error(model_id: &str, component: &str, err: SamSegError) -> SamSegError {
    match err {
        err @ SamSegError::Load { .. } => err,
        other => SamSegError::load(model_id, component, other),
    }
}
