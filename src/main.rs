use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use image::{DynamicImage, ImageFormat};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use sam_seg_rs::{
    Config, EmbeddingCache, ModelProvider, Notification, OnnxModelLoader, OutboundMessage,
    RequestEnvelope, RequestRouter, SegmentPhase, SegmentationWorker, WorkerOptions,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sam_seg_rs=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    if !config.model_dir().exists() {
        tracing::warn!(
            path = %config.model_dir().display(),
            "model directory does not exist, the first request will fail to load"
        );
    }
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create output directory: {}",
                config.output_dir.display()
            )
        })?;

    let options = WorkerOptions::from_config(&config);
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let router = RequestRouter::new(
        ModelProvider::new(OnnxModelLoader::from_config(&config)),
        EmbeddingCache::from_capacity(options.cache_capacity),
        notify_tx.clone(),
    );
    let worker = SegmentationWorker::with_router(router, &options);

    let writer = tokio::spawn(write_notifications(
        notify_rx,
        MaskWriter::new(&config),
    ));

    tracing::info!(
        model_id = %config.model_id,
        precision = ?config.precision,
        backend = ?config.backend,
        "waiting for requests on stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                drop(notify_tx);
                worker.shutdown().await;
                return writer.await.context("notification writer panicked")?;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match RequestEnvelope::from_json_line(line) {
                    Ok(envelope) => worker.send(envelope).await?,
                    Err(e) => {
                        tracing::warn!(error = %e, "discarding malformed request line");
                        let _ = notify_tx.send(Notification::error("envelope", &e));
                    }
                }
            }
        }
    }

    drop(notify_tx);
    worker.join().await;
    writer.await.context("notification writer panicked")?
}

/// Saves decoded masks as `<output-dir>/mask-<n>.<format>`.
struct MaskWriter {
    output_dir: PathBuf,
    extension: String,
    format: ImageFormat,
    written: usize,
}

impl MaskWriter {
    fn new(config: &Config) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            extension: config.format.clone(),
            format: config.output_format(),
            written: 0,
        }
    }

    fn next_path(&mut self) -> PathBuf {
        self.written += 1;
        self.output_dir
            .join(format!("mask-{}.{}", self.written, self.extension))
    }

    async fn save(&mut self, mask: DynamicImage) -> Result<PathBuf> {
        let path = self.next_path();
        let format = self.format;
        let target = path.clone();
        tokio::task::spawn_blocking(move || save_mask(&mask, &target, format)).await??;
        Ok(path)
    }
}

fn save_mask(mask: &DynamicImage, path: &Path, format: ImageFormat) -> Result<()> {
    mask.save_with_format(path, format)
        .with_context(|| format!("Failed to save mask: {}", path.display()))
}

fn embedding_spinner() -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] {msg}",
    )?);
    spinner.set_message("computing image embeddings");
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

async fn write_notifications(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    mut masks: MaskWriter,
) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut spinner: Option<ProgressBar> = None;

    while let Some(notification) = notifications.recv().await {
        let line = match notification {
            Notification::Ready => OutboundMessage::Ready.to_json_line()?,
            Notification::SegmentResult(phase) => {
                match phase {
                    SegmentPhase::Start => spinner = Some(embedding_spinner()?),
                    SegmentPhase::Done => {
                        if let Some(pb) = spinner.take() {
                            pb.finish_and_clear();
                        }
                    }
                }
                OutboundMessage::SegmentResult(phase).to_json_line()?
            }
            Notification::DecodeResult(result) => match masks.save(result.mask).await {
                Ok(path) => OutboundMessage::DecodeResult {
                    mask: &path,
                    scores: &result.scores,
                }
                .to_json_line()?,
                Err(e) => {
                    tracing::error!(error = %e, "failed to write decoded mask");
                    OutboundMessage::Error {
                        request: "decode",
                        message: &format!("{:#}", e),
                    }
                    .to_json_line()?
                }
            },
            Notification::Error { request, message } => {
                if let Some(pb) = spinner.take() {
                    pb.abandon();
                }
                OutboundMessage::Error {
                    request: &request,
                    message: &message,
                }
                .to_json_line()?
            }
        };

        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}
