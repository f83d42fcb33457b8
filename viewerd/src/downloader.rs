use std::path::PathBuf;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use crate::config::DownloaderConfig;
use crate::icon::cache::{prepare_part_file, IconCache};

/// A remote icon to bring into local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    /// Dimension tag selecting the storage subdirectory
    pub dimension: String,
    pub view_id: i32,
    pub is_notification_with_image: bool,
    /// Failed attempts so far
    pub retries: u32,
}

impl DownloadRequest {
    pub fn new(url: &str, dimension: &str, view_id: i32, is_notification_with_image: bool) -> Self {
        Self {
            url: url.to_string(),
            dimension: dimension.to_string(),
            view_id,
            is_notification_with_image,
            retries: 0,
        }
    }
}

/// Outcome of a download request, reported to the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// The icon for `url` is available locally
    Retrieved { url: String, path: PathBuf },
    /// The request for `url` was dropped for good
    Failed { url: String },
}

#[derive(Debug)]
enum Fetched {
    AlreadyPresent(PathBuf),
    Downloaded(PathBuf),
}

/// Handle to the bounded download queue
#[derive(Clone)]
pub struct DownloadHandle {
    tx: mpsc::Sender<DownloadRequest>,
}

impl DownloadHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DownloadRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a request without waiting. A full queue drops the request.
    pub fn enqueue(&self, request: DownloadRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                tracing::warn!("Download queue full, dropping request for {}", request.url);
                false
            }
            Err(TrySendError::Closed(request)) => {
                tracing::warn!("Downloader stopped, dropping request for {}", request.url);
                false
            }
        }
    }
}

pub struct Downloader {
    client: reqwest::Client,
    icons: IconCache,
    max_retries: u32,
    retry_delay: Duration,
}

impl Downloader {
    pub fn new(config: &DownloaderConfig, icons: IconCache) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            icons,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        })
    }

    async fn fetch(&self, request: &DownloadRequest) -> Result<Fetched> {
        let path = self.icons.storage_path(&request.url, &request.dimension);
        if path.is_file() {
            return Ok(Fetched::AlreadyPresent(path));
        }

        let response = self
            .client
            .get(&request.url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", request.url))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            bail!("{} returned {}", request.url, status);
        }
        match response.content_length() {
            Some(len) if len > 0 => {}
            _ => bail!("{} returned no content length", request.url),
        }

        let part = prepare_part_file(&path)?;
        let mut file = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.with_context(|| format!("Failed reading body of {}", request.url))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", part.display()))?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part, &path)
            .await
            .with_context(|| format!("Failed to move download into {}", path.display()))?;

        Ok(Fetched::Downloaded(path))
    }

    /// Count a failure against `request`; returns the cool-down before the
    /// next attempt, or `None` once the retry bound is exceeded.
    ///
    /// `max_retries` counts retries after the first attempt, so with the
    /// default of 10 the 11th failure drops the request.
    fn next_retry(&self, request: &mut DownloadRequest) -> Option<Duration> {
        request.retries += 1;
        (request.retries <= self.max_retries).then_some(self.retry_delay)
    }
}

fn schedule_retry(
    handle: DownloadHandle,
    request: DownloadRequest,
    delay: Duration,
    events: mpsc::Sender<DownloadEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let url = request.url.clone();
                if !handle.enqueue(request) {
                    send_event(&events, DownloadEvent::Failed { url }).await;
                }
            }
            _ = cancel.cancelled() => {}
        }
    });
}

async fn send_event(events: &mpsc::Sender<DownloadEvent>, event: DownloadEvent) {
    if let Err(e) = events.send(event).await {
        tracing::error!("Failed to send download event: {}", e);
    }
}

/// Download worker loop. One request at a time, so a URL is never fetched
/// twice concurrently.
pub async fn run(
    downloader: Downloader,
    handle: DownloadHandle,
    mut rx: mpsc::Receiver<DownloadRequest>,
    events: mpsc::Sender<DownloadEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting icon downloader");

    loop {
        tokio::select! {
            Some(mut request) = rx.recv() => {
                tracing::debug!(
                    url = %request.url,
                    dimension = %request.dimension,
                    view_id = request.view_id,
                    with_image = request.is_notification_with_image,
                    "Processing download request"
                );
                match downloader.fetch(&request).await {
                    Ok(fetched) => {
                        let path = match fetched {
                            Fetched::AlreadyPresent(path) => {
                                tracing::debug!("Icon for {} already present", request.url);
                                path
                            }
                            Fetched::Downloaded(path) => {
                                tracing::info!("Downloaded {} to {}", request.url, path.display());
                                path
                            }
                        };
                        send_event(&events, DownloadEvent::Retrieved { url: request.url, path }).await;
                    }
                    Err(e) => {
                        tracing::warn!("Download failed: {:#}", e);
                        match downloader.next_retry(&mut request) {
                            Some(delay) => {
                                tracing::debug!(
                                    "Retrying {} in {:?} (attempt {})",
                                    request.url,
                                    delay,
                                    request.retries + 1
                                );
                                schedule_retry(handle.clone(), request, delay, events.clone(), cancel.clone());
                            }
                            None => {
                                tracing::warn!(
                                    "Giving up on {} after {} failures",
                                    request.url,
                                    request.retries
                                );
                                send_event(&events, DownloadEvent::Failed { url: request.url }).await;
                            }
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Icon downloader shutting down");
                break;
            }
        }
    }

    Ok(())
}
