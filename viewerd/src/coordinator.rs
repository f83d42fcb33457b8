use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::types::{Announcement, DeviceLoss};
use crate::bus::browser::BrowserEvent;
use crate::registry::DeviceRegistry;
use crate::resolver::ResolverHandle;

/// Routes bus callbacks into the registry and resolver, keeping registry
/// writes (and their sqlite persistence) off the async workers.
#[derive(Clone)]
pub struct Coordinator {
    registry: DeviceRegistry,
    resolver: ResolverHandle,
}

impl Coordinator {
    pub fn new(registry: DeviceRegistry, resolver: ResolverHandle) -> Self {
        Self { registry, resolver }
    }

    pub async fn on_announcement(&self, announcement: Announcement) -> Result<()> {
        let registry = self.registry.clone();
        let id = tokio::task::spawn_blocking(move || registry.upsert_from_announcement(&announcement))
            .await
            .context("Announcement handler panicked")?;

        if let Some(id) = id {
            self.resolver.announced(id).await?;
        }
        Ok(())
    }

    pub async fn on_loss(&self, loss: DeviceLoss) -> Result<()> {
        let registry = self.registry.clone();
        let id = tokio::task::spawn_blocking(move || registry.mark_lost(&loss.service_name, loss.verified))
            .await
            .context("Loss handler panicked")?;

        if let Some(id) = id {
            self.resolver.forget(id).await?;
        }
        Ok(())
    }
}

/// Coordinator event loop, one bus event at a time so callbacks for a
/// peer are applied in delivery order.
pub async fn run(
    coordinator: Coordinator,
    mut rx: mpsc::Receiver<BrowserEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                match event {
                    BrowserEvent::Announced(announcement) => {
                        if let Err(e) = coordinator.on_announcement(announcement).await {
                            tracing::error!("Failed to handle announcement: {}", e);
                        }
                    }
                    BrowserEvent::Lost(loss) => {
                        if let Err(e) = coordinator.on_loss(loss).await {
                            tracing::error!("Failed to handle device loss: {}", e);
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Coordinator shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::runtime::Handle;
    use tokio::sync::broadcast;
    use uuid::Uuid;
    use shared::types::{DeviceStatus, UiEvent};
    use crate::bus::testing::FakeTransport;
    use crate::config::ResolverConfig;
    use crate::downloader::DownloadHandle;
    use crate::icon::IconCache;
    use crate::registry::db::DeviceStore;
    use crate::registry::tests::announcement;
    use crate::resolver::Engine;

    struct Fixture {
        coordinator: Coordinator,
        registry: DeviceRegistry,
        resolver: ResolverHandle,
        transport: Arc<FakeTransport>,
        events: broadcast::Receiver<UiEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        // Every URL lookup fails, so cycles end up abandoned
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, events) = broadcast::channel(64);
        let registry = DeviceRegistry::new(
            DeviceStore::open(":memory:").unwrap(),
            transport.clone(),
            events_tx.clone(),
        );
        let (downloads, _rx) = DownloadHandle::channel(10);
        let config = ResolverConfig {
            url_lookup_max_attempts: 1,
            ..ResolverConfig::default()
        };
        let engine = Engine::new(
            &config,
            registry.clone(),
            transport.clone(),
            IconCache::new(dir.path(), None, 1.0),
            downloads,
            events_tx,
        );
        let (resolver, _thread) = ResolverHandle::spawn(engine, 16, Handle::current()).unwrap();

        Fixture {
            coordinator: Coordinator::new(registry.clone(), resolver.clone()),
            registry,
            resolver,
            transport,
            events,
            _dir: dir,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_flow_through_loop() {
        let mut fx = fixture();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run(fx.coordinator.clone(), rx, cancel.clone()));
        let id = Uuid::new_v4();

        tx.send(BrowserEvent::Announced(announcement(":1.3", id, "Washer"))).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), fx.events.recv()).await.unwrap().unwrap();
        assert_eq!(event, UiEvent::DeviceFound { id });
        assert_eq!(fx.registry.get(id).unwrap().status, DeviceStatus::Available);

        tx.send(BrowserEvent::Lost(DeviceLoss { service_name: ":1.3".to_string(), verified: false })).await.unwrap();
        tx.send(BrowserEvent::Lost(DeviceLoss { service_name: ":1.3".to_string(), verified: true })).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), fx.events.recv()).await.unwrap().unwrap();
        assert_eq!(event, UiEvent::DeviceLost { id });
        assert!(!fx.registry.contains(id));

        cancel.cancel();
        worker.await.unwrap().unwrap();
        fx.resolver.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callbacks_apply_in_delivery_order() {
        let mut fx = fixture();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        // Queued before the loop starts: a loss racing ahead of the
        // announcement would match nothing and leave the device behind
        tx.send(BrowserEvent::Announced(announcement(":1.3", id, "Washer"))).await.unwrap();
        tx.send(BrowserEvent::Lost(DeviceLoss { service_name: ":1.3".to_string(), verified: true })).await.unwrap();
        let worker = tokio::spawn(run(fx.coordinator.clone(), rx, cancel.clone()));

        let lost = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let UiEvent::DeviceLost { id } = fx.events.recv().await.unwrap() {
                    return id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(lost, id);
        assert!(!fx.registry.contains(id));

        cancel.cancel();
        worker.await.unwrap().unwrap();
        fx.resolver.shutdown().await.unwrap();
    }

    async fn wait_for_url_calls(transport: &FakeTransport, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.url_calls() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reannouncement_restarts_abandoned_resolution() {
        let fx = fixture();
        let id = Uuid::new_v4();
        fx.coordinator.on_announcement(announcement(":1.3", id, "Washer")).await.unwrap();

        // A single failed lookup abandons the cycle
        fx.resolver.request_icon(id, false, 1);
        wait_for_url_calls(&fx.transport, 1).await;
        assert!(fx.resolver.is_using_default_image(id).await.unwrap());

        // Cooling: a repeated request is a no-op
        fx.resolver.request_icon(id, false, 1);
        assert!(fx.resolver.is_using_default_image(id).await.unwrap());
        assert_eq!(fx.transport.url_calls(), 1);

        fx.coordinator.on_announcement(announcement(":1.4", id, "Washer")).await.unwrap();
        fx.resolver.request_icon(id, false, 1);
        wait_for_url_calls(&fx.transport, 2).await;

        assert_eq!(fx.registry.get(id).unwrap().service_name, ":1.4");
        assert_eq!(*fx.transport.detached.lock(), vec![":1.3".to_string()]);
        fx.resolver.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_loss_is_ignored() {
        let fx = fixture();
        fx.coordinator
            .on_loss(DeviceLoss { service_name: ":1.99".to_string(), verified: true })
            .await
            .unwrap();
        assert!(fx.registry.devices().is_empty());
        fx.resolver.shutdown().await.unwrap();
    }
}
