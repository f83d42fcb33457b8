use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use anyhow::{Context as _, Result};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use shared::protocol::ICON_DEFAULT_URL;
use shared::types::UiEvent;
use crate::bus::IconTransport;
use crate::config::Config;
use crate::downloader::{self, DownloadHandle, Downloader};
use crate::icon::IconCache;
use crate::registry::db::DeviceStore;
use crate::registry::DeviceRegistry;
use crate::resolver::{self, Engine, ResolverHandle};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The shared components UI-facing code talks to.
#[derive(Clone)]
pub struct Context {
    pub registry: DeviceRegistry,
    pub icons: IconCache,
    pub resolver: ResolverHandle,
}

/// Background workers started by [`Context::init`]
pub struct Workers {
    cancel: CancellationToken,
    resolver: ResolverHandle,
    resolver_thread: thread::JoinHandle<()>,
    downloader: JoinHandle<()>,
    bridge: JoinHandle<()>,
}

impl Context {
    /// Open the device store, load persisted devices and start the
    /// resolver and downloader.
    pub fn init(config: &Config, transport: Arc<dyn IconTransport>, cancel: CancellationToken) -> Result<(Self, Workers)> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let store = DeviceStore::open(&config.store.db_path)?;
        tracing::info!("Opened device store at {:?}", config.store.db_path);

        let registry = DeviceRegistry::new(store, transport.clone(), events.clone());
        registry.load()?;

        let icons = IconCache::from_config(&config.icons);
        tracing::info!(
            "Icon storage at {:?} ({})",
            config.icons.storage_dir,
            icons.dimension()
        );

        let (download_handle, download_rx) = DownloadHandle::channel(config.downloader.queue_capacity);
        let (download_events_tx, download_events_rx) = mpsc::channel(config.downloader.queue_capacity);
        let downloader = Downloader::new(&config.downloader, icons.clone())?;

        let engine = Engine::new(
            &config.resolver,
            registry.clone(),
            transport,
            icons.clone(),
            download_handle.clone(),
            events,
        );
        let (resolver, resolver_thread) =
            ResolverHandle::spawn(engine, config.resolver.queue_capacity, Handle::current())?;

        let dl_cancel = cancel.clone();
        let downloader = tokio::spawn(async move {
            if let Err(e) = downloader::run(downloader, download_handle, download_rx, download_events_tx, dl_cancel).await {
                tracing::error!("Downloader error: {}", e);
            }
        });

        let bridge_resolver = resolver.clone();
        let bridge = tokio::spawn(async move {
            if let Err(e) = resolver::forward_downloads(bridge_resolver, download_events_rx).await {
                tracing::error!("Download bridge error: {}", e);
            }
        });

        let context = Self {
            registry,
            icons,
            resolver: resolver.clone(),
        };
        let workers = Workers {
            cancel,
            resolver,
            resolver_thread,
            downloader,
            bridge,
        };
        Ok((context, workers))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.registry.subscribe()
    }

    /// Local icon of a device, if one is available now. Otherwise a
    /// resolution is queued and the caller draws the default image until
    /// `IconAvailable` arrives.
    pub fn device_image(&self, device_id: Uuid, is_notification_with_image: bool, view_id: i32) -> Option<PathBuf> {
        let device = self.registry.get(device_id)?;

        match device.stored_icon_url.as_deref() {
            Some(ICON_DEFAULT_URL) => return None,
            Some(url) => {
                if let Some(path) = self.icons.lookup(url) {
                    return Some(path);
                }
            }
            None => {}
        }

        self.resolver.request_icon(device_id, is_notification_with_image, view_id);
        None
    }

    pub async fn is_using_default_image(&self, device_id: Uuid) -> Result<bool> {
        self.resolver.is_using_default_image(device_id).await
    }
}

impl Workers {
    /// Stop the downloader and resolver and wait for them
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        let _ = self.downloader.await;

        if let Err(e) = self.resolver.shutdown().await {
            tracing::error!("Failed to shutdown resolver: {}", e);
        }
        let resolver_thread = self.resolver_thread;
        tokio::task::spawn_blocking(move || resolver_thread.join())
            .await
            .context("Failed to join resolver thread")?
            .map_err(|_| anyhow::anyhow!("Resolver thread panicked"))?;

        // The downloader dropped its sender, so the bridge drains and ends
        let _ = self.bridge.await;
        Ok(())
    }
}
