use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;
use shared::protocol::{ICON_DEFAULT_URL, ICON_LOCAL_PREFIX_URL, IGNORE_VIEW_ID};
use shared::types::UiEvent;
use crate::bus::IconTransport;
use crate::config::ResolverConfig;
use crate::downloader::{DownloadEvent, DownloadHandle, DownloadRequest};
use crate::icon::IconCache;
use crate::registry::device::{Capability, Device};
use crate::registry::DeviceRegistry;

/// Device tag recording the last capability call made on a device
pub const LAST_ACTION_TAG: &str = "last_action";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    UrlLookup { attempts: u32 },
    ContentFetch { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Resolved(String),
    DefaultImage,
    /// Retry bound exceeded; cool until the next announcement
    Abandoned,
}

/// Per-device resolution state. At most one per device.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub device_id: Uuid,
    pub phase: Phase,
    pub outcome: Option<Outcome>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub using_default_image: bool,
    pub is_notification_with_image: bool,
    pub view_id: i32,
    cycle: u64,
}

impl CacheEntry {
    fn new(device_id: Uuid, is_notification_with_image: bool, view_id: i32, cycle: u64) -> Self {
        Self {
            device_id,
            phase: Phase::UrlLookup { attempts: 0 },
            outcome: None,
            last_attempt: None,
            using_default_image: true,
            is_notification_with_image,
            view_id,
            cycle,
        }
    }

    fn in_flight(&self) -> bool {
        self.outcome.is_none()
    }
}

/// What the worker should do with a device after one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Finished,
    /// Run the next phase right away
    Requeue,
    RetryAfter(Duration),
    /// Parked until the downloader reports the URL
    Waiting,
    Abandoned,
    /// Device or entry no longer exists
    Gone,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

/// Two-phase icon resolution state machine for every device.
/// Only the resolver thread touches it.
pub struct Engine {
    registry: DeviceRegistry,
    transport: Arc<dyn IconTransport>,
    icons: IconCache,
    downloads: DownloadHandle,
    events: broadcast::Sender<UiEvent>,
    url_lookup: RetryPolicy,
    content_fetch: RetryPolicy,
    entries: HashMap<Uuid, CacheEntry>,
    /// Icon URL -> devices waiting for it to be available locally
    waiters: HashMap<String, HashSet<Uuid>>,
    next_cycle: u64,
}

impl Engine {
    pub fn new(
        config: &ResolverConfig,
        registry: DeviceRegistry,
        transport: Arc<dyn IconTransport>,
        icons: IconCache,
        downloads: DownloadHandle,
        events: broadcast::Sender<UiEvent>,
    ) -> Self {
        Self {
            registry,
            transport,
            icons,
            downloads,
            events,
            url_lookup: RetryPolicy {
                max_attempts: config.url_lookup_max_attempts,
                delay: config.url_lookup_retry(),
            },
            content_fetch: RetryPolicy {
                max_attempts: config.content_fetch_max_attempts,
                delay: config.content_fetch_retry(),
            },
            entries: HashMap::new(),
            waiters: HashMap::new(),
            next_cycle: 0,
        }
    }

    /// Start a resolution cycle for a device. Returns false if the device
    /// already has an entry, in flight or finished.
    pub fn request_icon(&mut self, device_id: Uuid, is_notification_with_image: bool, view_id: i32) -> bool {
        if let Some(entry) = self.entries.get(&device_id) {
            if let Some(Outcome::Resolved(url)) = &entry.outcome {
                tracing::debug!("Icon of {} already resolved to {}", device_id, url);
            }
            return false;
        }

        self.next_cycle += 1;
        let entry = CacheEntry::new(device_id, is_notification_with_image, view_id, self.next_cycle);
        self.entries.insert(device_id, entry);
        true
    }

    /// True if a retry timer armed for `cycle` still applies
    pub fn is_current(&self, device_id: Uuid, cycle: u64) -> bool {
        self.entries
            .get(&device_id)
            .is_some_and(|e| e.cycle == cycle && e.in_flight())
    }

    pub fn cycle_of(&self, device_id: Uuid) -> Option<u64> {
        self.entries.get(&device_id).map(|e| e.cycle)
    }

    /// Run the current phase of a device once
    pub fn process(&mut self, device_id: Uuid) -> Step {
        let Some(device) = self.registry.get(device_id) else {
            self.forget(device_id);
            return Step::Gone;
        };
        let Some(entry) = self.entries.get(&device_id) else {
            return Step::Gone;
        };
        if !entry.in_flight() {
            return Step::Finished;
        }

        let phase = entry.phase;
        match phase {
            Phase::UrlLookup { .. } => self.lookup_url(&device),
            Phase::ContentFetch { .. } => self.fetch_content(&device),
        }
    }

    fn lookup_url(&mut self, device: &Device) -> Step {
        let id = device.id();
        if !device.supports(Capability::Icon) {
            tracing::debug!("Device {} has no icon interface, using default image", id);
            return self.finish(id, Outcome::DefaultImage);
        }

        tracing::debug!("Looking up icon URL of {}", id);
        self.registry.set_tag(id, LAST_ACTION_TAG, "get_icon_url");

        match self.transport.icon_url(&device.peer()) {
            Ok(url) if !url.is_empty() => {
                tracing::debug!("Device {} icon URL is {}", id, url);
                self.registry.set_stored_icon_url(id, &url);

                if self.icons.is_available(&url) {
                    let step = self.finish(id, Outcome::Resolved(url));
                    if let Some(entry) = self.entries.get(&id) {
                        // Banner requests draw the local icon themselves
                        if entry.view_id != IGNORE_VIEW_ID {
                            self.emit(icon_available(entry));
                        }
                    }
                    return step;
                }

                self.wait_for_download(id, url)
            }
            Ok(_) => {
                tracing::debug!("Device {} has no icon URL, fetching content", id);
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.phase = Phase::ContentFetch { attempts: 0 };
                }
                Step::Requeue
            }
            Err(e) => {
                tracing::warn!("Icon URL lookup for {} failed: {}", id, e);
                self.fail(id)
            }
        }
    }

    fn wait_for_download(&mut self, id: Uuid, url: String) -> Step {
        let Some(entry) = self.entries.get(&id) else {
            return Step::Gone;
        };

        let waiting = self.waiters.entry(url.clone()).or_default();
        let first = waiting.is_empty();
        waiting.insert(id);
        if !first {
            tracing::debug!("Icon {} already being downloaded, {} joins", url, id);
            return Step::Waiting;
        }

        let request = DownloadRequest::new(
            &url,
            self.icons.dimension(),
            entry.view_id,
            entry.is_notification_with_image,
        );
        if self.downloads.enqueue(request) {
            tracing::debug!("Requested download of {} for {}", url, id);
            return Step::Waiting;
        }

        // Dropped by the downloader: cool until the next announcement
        self.waiters.remove(&url);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.outcome = Some(Outcome::Abandoned);
        }
        Step::Abandoned
    }

    fn fetch_content(&mut self, device: &Device) -> Step {
        let id = device.id();
        self.registry.set_tag(id, LAST_ACTION_TAG, "get_icon_content");

        match self.store_device_content(device) {
            Ok(Some(url)) => {
                tracing::debug!("Stored icon content of {} as {}", id, url);
                self.registry.set_stored_icon_url(id, &url);
                let step = self.finish(id, Outcome::Resolved(url));
                if let Some(entry) = self.entries.get(&id) {
                    self.emit(icon_available(entry));
                }
                step
            }
            Ok(None) => {
                tracing::debug!("Device {} icon content is empty, using default image", id);
                self.registry.set_stored_icon_url(id, ICON_DEFAULT_URL);
                self.finish(id, Outcome::DefaultImage)
            }
            Err(e) => {
                tracing::warn!("Icon content fetch for {} failed: {:#}", id, e);
                self.fail(id)
            }
        }
    }

    /// Fetch, decode and store the raw icon of a device under a synthetic
    /// local URL. `None` when the device has no content.
    fn store_device_content(&self, device: &Device) -> Result<Option<String>> {
        let peer = device.peer();

        if self.transport.icon_size(&peer)? == 0 {
            return Ok(None);
        }
        let content = self.transport.icon_content(&peer)?;
        if content.is_empty() {
            return Ok(None);
        }

        let mime_type = self.transport.icon_mime_type(&peer).unwrap_or_default();
        let image = decode_icon(&content, &mime_type)?;

        let url = format!("{}{}", ICON_LOCAL_PREFIX_URL, device.id());
        self.icons.store_image(&url, &image)?;
        Ok(Some(url))
    }

    fn fail(&mut self, id: Uuid) -> Step {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Step::Gone;
        };
        entry.last_attempt = Some(Utc::now());

        let (attempts, policy) = match &mut entry.phase {
            Phase::UrlLookup { attempts } => {
                *attempts += 1;
                (*attempts, self.url_lookup)
            }
            Phase::ContentFetch { attempts } => {
                *attempts += 1;
                (*attempts, self.content_fetch)
            }
        };

        if attempts < policy.max_attempts {
            return Step::RetryAfter(policy.delay);
        }

        tracing::warn!(
            "Giving up on icon of {} after {} attempts ({:?}, last at {:?})",
            id,
            attempts,
            entry.phase,
            entry.last_attempt
        );
        entry.outcome = Some(Outcome::Abandoned);
        entry.using_default_image = true;
        Step::Abandoned
    }

    fn finish(&mut self, id: Uuid, outcome: Outcome) -> Step {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.using_default_image = !matches!(outcome, Outcome::Resolved(_));
            entry.outcome = Some(outcome);
        }
        Step::Finished
    }

    /// The downloader made `url` available: notify every device waiting on it.
    /// Returns the number of devices notified.
    pub fn on_retrieved(&mut self, url: &str) -> usize {
        let Some(waiting) = self.waiters.remove(url) else {
            tracing::debug!("Retrieved {} with no waiters", url);
            return 0;
        };

        let mut notified = 0;
        for id in waiting {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            entry.outcome = Some(Outcome::Resolved(url.to_string()));
            entry.using_default_image = false;

            let event = icon_available(entry);
            self.emit(event);
            notified += 1;
        }

        tracing::debug!("Icon {} available for {} devices", url, notified);
        notified
    }

    /// The downloader gave up on `url`: every device waiting on it ends its
    /// cycle abandoned. Returns the number of devices affected.
    pub fn on_download_failed(&mut self, url: &str) -> usize {
        let Some(waiting) = self.waiters.remove(url) else {
            return 0;
        };

        let mut abandoned = 0;
        for id in waiting {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.outcome = Some(Outcome::Abandoned);
                entry.using_default_image = true;
                abandoned += 1;
            }
        }

        tracing::warn!("Download of {} failed, {} devices fall back to the default icon", url, abandoned);
        abandoned
    }

    /// Drop all state of a removed device
    pub fn forget(&mut self, id: Uuid) {
        self.entries.remove(&id);
        self.waiters.retain(|_, waiting| {
            waiting.remove(&id);
            !waiting.is_empty()
        });
    }

    /// A new announcement clears a finished cycle that left the device on
    /// the default image, or one parked on a download, so the next request
    /// starts over.
    pub fn announced(&mut self, id: Uuid) {
        let reset = self.entries.get(&id).is_some_and(|e| {
            matches!(e.outcome, Some(Outcome::Abandoned) | Some(Outcome::DefaultImage))
        }) || self.waiters.values().any(|waiting| waiting.contains(&id));
        if reset {
            tracing::debug!("Re-announcement of {} resets its icon resolution", id);
            self.forget(id);
        }
    }

    /// Unknown devices draw the default image
    pub fn is_using_default_image(&self, id: Uuid) -> bool {
        self.entries.get(&id).map_or(true, |e| e.using_default_image)
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.events.send(event);
    }
}

/// Build the availability event for an entry. Banner requests carry no view id.
fn icon_available(entry: &CacheEntry) -> UiEvent {
    let view_id = (entry.view_id != IGNORE_VIEW_ID && !entry.is_notification_with_image)
        .then_some(entry.view_id);

    UiEvent::IconAvailable {
        app_id: entry.device_id,
        view_id,
        is_notification_with_image: entry.is_notification_with_image,
    }
}

fn decode_icon(bytes: &[u8], mime_type: &str) -> Result<DynamicImage> {
    let decoded = match ImageFormat::from_mime_type(mime_type) {
        Some(format) => image::load_from_memory_with_format(bytes, format),
        None => image::load_from_memory(bytes),
    };
    decoded.context("Failed to decode icon content")
}

/// Commands sent to the resolver thread
pub enum ResolverCommand {
    Request {
        device_id: Uuid,
        is_notification_with_image: bool,
        view_id: i32,
    },
    Retry {
        device_id: Uuid,
        cycle: u64,
    },
    Retrieved(String),
    DownloadFailed(String),
    Forget(Uuid),
    Announced(Uuid),
    UsingDefaultImage(Uuid, oneshot::Sender<bool>),
    Shutdown,
}

/// Handle to the resolver thread
#[derive(Clone)]
pub struct ResolverHandle {
    tx: mpsc::Sender<ResolverCommand>,
}

impl ResolverHandle {
    /// Spawn the resolver thread. Retry timers run on `runtime`.
    pub fn spawn(mut engine: Engine, capacity: usize, runtime: Handle) -> Result<(Self, thread::JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::channel::<ResolverCommand>(capacity);
        let timer_tx = tx.downgrade();

        let join = thread::Builder::new()
            .name("icon-resolver".to_string())
            .spawn(move || {
                let mut pending: VecDeque<Uuid> = VecDeque::new();

                loop {
                    while let Some(id) = pending.pop_front() {
                        match engine.process(id) {
                            Step::Requeue => pending.push_back(id),
                            Step::RetryAfter(delay) => {
                                if let (Some(cycle), Some(tx)) = (engine.cycle_of(id), timer_tx.upgrade()) {
                                    runtime.spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        let _ = tx.send(ResolverCommand::Retry { device_id: id, cycle }).await;
                                    });
                                }
                            }
                            _ => {}
                        }
                    }

                    let Some(cmd) = rx.blocking_recv() else {
                        break;
                    };
                    match cmd {
                        ResolverCommand::Request { device_id, is_notification_with_image, view_id } => {
                            if engine.request_icon(device_id, is_notification_with_image, view_id) {
                                pending.push_back(device_id);
                            }
                        }
                        ResolverCommand::Retry { device_id, cycle } => {
                            if engine.is_current(device_id, cycle) {
                                pending.push_back(device_id);
                            }
                        }
                        ResolverCommand::Retrieved(url) => {
                            engine.on_retrieved(&url);
                        }
                        ResolverCommand::DownloadFailed(url) => {
                            engine.on_download_failed(&url);
                        }
                        ResolverCommand::Forget(id) => engine.forget(id),
                        ResolverCommand::Announced(id) => engine.announced(id),
                        ResolverCommand::UsingDefaultImage(id, reply) => {
                            let _ = reply.send(engine.is_using_default_image(id));
                        }
                        ResolverCommand::Shutdown => {
                            tracing::info!("Icon resolver shutting down");
                            break;
                        }
                    }
                }
            })
            .context("Failed to spawn resolver thread")?;

        Ok((Self { tx }, join))
    }

    /// Ask for a device icon; the result arrives as an `IconAvailable` event.
    /// Idempotent while the device has an entry.
    pub fn request_icon(&self, device_id: Uuid, is_notification_with_image: bool, view_id: i32) {
        let cmd = ResolverCommand::Request {
            device_id,
            is_notification_with_image,
            view_id,
        };
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Resolver queue full, dropping icon request for {}", device_id);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Resolver stopped, dropping icon request for {}", device_id);
            }
        }
    }

    pub async fn retrieved(&self, url: String) -> Result<()> {
        self.tx.send(ResolverCommand::Retrieved(url)).await?;
        Ok(())
    }

    pub async fn download_failed(&self, url: String) -> Result<()> {
        self.tx.send(ResolverCommand::DownloadFailed(url)).await?;
        Ok(())
    }

    pub async fn forget(&self, device_id: Uuid) -> Result<()> {
        self.tx.send(ResolverCommand::Forget(device_id)).await?;
        Ok(())
    }

    pub async fn announced(&self, device_id: Uuid) -> Result<()> {
        self.tx.send(ResolverCommand::Announced(device_id)).await?;
        Ok(())
    }

    pub async fn is_using_default_image(&self, device_id: Uuid) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ResolverCommand::UsingDefaultImage(device_id, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(ResolverCommand::Shutdown).await?;
        Ok(())
    }
}

/// Bridge downloader outcomes into the resolver
pub async fn forward_downloads(
    resolver: ResolverHandle,
    mut rx: mpsc::Receiver<DownloadEvent>,
) -> Result<()> {
    while let Some(event) = rx.recv().await {
        let sent = match event {
            DownloadEvent::Retrieved { url, path } => {
                tracing::debug!("Icon {} stored at {}", url, path.display());
                resolver.retrieved(url).await
            }
            DownloadEvent::Failed { url } => resolver.download_failed(url).await,
        };
        if let Err(e) = sent {
            tracing::error!("Failed to forward download event: {}", e);
            break;
        }
    }
    Ok(())
}
