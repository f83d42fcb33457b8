pub mod db;
pub mod device;

use std::collections::HashMap;
use std::sync::Arc;
use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;
use shared::protocol::{ABOUT_APP_ID, ABOUT_DEFAULT_LANGUAGE, ABOUT_DEVICE_NAME, ABOUT_SUPPORT_URL};
use shared::types::{Announcement, DeviceStatus, UiEvent};
use crate::bus::IconTransport;
use self::db::DeviceStore;
use self::device::{Capability, Device};

/// Authoritative map of known devices.
///
/// All mutation goes through these methods; events are emitted while the
/// device map is still locked so observers never see an update out of order
/// with its event.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    devices: RwLock<HashMap<Uuid, Device>>,
    store: Mutex<DeviceStore>,
    transport: Arc<dyn IconTransport>,
    events: broadcast::Sender<UiEvent>,
}

impl DeviceRegistry {
    pub fn new(
        store: DeviceStore,
        transport: Arc<dyn IconTransport>,
        events: broadcast::Sender<UiEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                devices: RwLock::new(HashMap::new()),
                store: Mutex::new(store),
                transport,
                events,
            }),
        }
    }

    /// Load previously seen devices as unavailable placeholders.
    /// Returns the number of records read.
    pub fn load(&self) -> Result<usize> {
        let stored = self.inner.store.lock().load_all()?;
        let count = stored.len();

        let mut devices = self.inner.devices.write();
        for record in stored {
            tracing::debug!("Loaded persisted device {}", record.id);
            match devices.get_mut(&record.id) {
                // Already announced: the announced name wins
                Some(device) => {
                    if record.stored_icon_url.is_some() {
                        device.stored_icon_url = record.stored_icon_url;
                    }
                }
                None => {
                    devices.insert(record.id, Device::placeholder(record));
                }
            }
        }

        tracing::info!("Loaded {} persisted devices", count);
        Ok(count)
    }

    /// Create or refresh a device from an announcement.
    /// Returns the device id, or `None` if the announcement carried no valid AppId.
    pub fn upsert_from_announcement(&self, announcement: &Announcement) -> Option<Uuid> {
        let Some(id) = parse_app_id(announcement) else {
            tracing::error!(
                "Announcement from {} has no valid {}, ignoring",
                announcement.service_name,
                ABOUT_APP_ID
            );
            return None;
        };

        let metadata = &announcement.metadata;
        let mut devices = self.inner.devices.write();

        let is_new = !devices.contains_key(&id);
        let device = devices.entry(id).or_insert_with(|| {
            tracing::info!("New device {} at {}", id, announcement.service_name);
            Device::new(id, announcement.service_name.clone())
        });

        if device.service_name != announcement.service_name {
            if !device.service_name.is_empty() {
                self.inner.transport.detach(&device.service_name);
            }
            tracing::debug!(
                "Device {} rebound from {:?} to {}",
                id,
                device.service_name,
                announcement.service_name
            );
            device.service_name = announcement.service_name.clone();
        }

        let mut name_changed = is_new;
        if let Some(name) = metadata.get(ABOUT_DEVICE_NAME) {
            if *name != device.friendly_name {
                device.friendly_name = name.clone();
                name_changed = true;
            }
        }
        if let Some(language) = metadata.get(ABOUT_DEFAULT_LANGUAGE) {
            device.default_language = language.clone();
        }
        if let Some(help_url) = metadata.get(ABOUT_SUPPORT_URL) {
            device.help_url = help_url.clone();
        }

        device.port = announcement.port;
        device.about = metadata.clone();
        device.about_dirty = true;
        device.objects = announcement.objects.clone();
        device.capabilities = Capability::from_objects(&announcement.objects);
        device.last_announced = Some(Utc::now());

        let status_changed = device.status != DeviceStatus::Available;
        device.status = DeviceStatus::Available;

        if name_changed {
            self.persist(device);
        }
        if status_changed {
            self.emit(UiEvent::DeviceStatusChanged { id });
        }
        self.emit(UiEvent::DeviceFound { id });

        Some(id)
    }

    /// Handle a loss event for the device currently bound to `service_name`.
    /// Only verified losses evict; returns the removed device's id.
    pub fn mark_lost(&self, service_name: &str, verified: bool) -> Option<Uuid> {
        if !verified {
            tracing::debug!("Unverified loss of {}, keeping device", service_name);
            return None;
        }
        // Placeholders loaded from the store have no bus name yet
        if service_name.is_empty() {
            return None;
        }

        let mut devices = self.inner.devices.write();
        let id = devices
            .values()
            .find(|d| d.service_name == service_name)
            .map(Device::id);

        let Some(id) = id else {
            tracing::debug!("Loss of {} matches no known device", service_name);
            return None;
        };

        if let Some(device) = devices.remove(&id) {
            tracing::info!(
                "Device lost: {} ({}) at {}",
                device.friendly_name,
                id,
                service_name
            );
        }
        self.inner.transport.detach(service_name);
        self.emit(UiEvent::DeviceLost { id });

        Some(id)
    }

    pub fn get(&self, id: Uuid) -> Option<Device> {
        self.inner.devices.read().get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.devices.read().contains_key(&id)
    }

    /// The device currently bound to a transient bus address
    pub fn by_service_name(&self, service_name: &str) -> Option<Device> {
        if service_name.is_empty() {
            return None;
        }
        self.inner
            .devices
            .read()
            .values()
            .find(|d| d.service_name == service_name)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner.devices.read().values().cloned().collect()
    }

    /// Record the resolved icon URL of a device, persisting it when changed.
    /// Returns false if the device is unknown.
    pub fn set_stored_icon_url(&self, id: Uuid, url: &str) -> bool {
        let mut devices = self.inner.devices.write();
        let Some(device) = devices.get_mut(&id) else {
            return false;
        };

        if device.stored_icon_url.as_deref() != Some(url) {
            device.stored_icon_url = Some(url.to_string());
            self.persist(device);
        }
        true
    }

    /// About metadata of a device; reading it clears the dirty flag
    pub fn read_about(&self, id: Uuid) -> Option<HashMap<String, String>> {
        let mut devices = self.inner.devices.write();
        let device = devices.get_mut(&id)?;
        device.about_dirty = false;
        Some(device.about.clone())
    }

    pub fn set_tag(&self, id: Uuid, key: &str, value: &str) {
        if let Some(device) = self.inner.devices.write().get_mut(&id) {
            device.tags.insert(key.to_string(), value.to_string());
        }
    }

    pub fn tag(&self, id: Uuid, key: &str) -> Option<String> {
        self.inner
            .devices
            .read()
            .get(&id)
            .and_then(|d| d.tags.get(key).cloned())
    }

    pub fn remove_tag(&self, id: Uuid, key: &str) {
        if let Some(device) = self.inner.devices.write().get_mut(&id) {
            device.tags.remove(key);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.inner.events.subscribe()
    }

    fn persist(&self, device: &Device) {
        if let Err(e) = self.inner.store.lock().save(&device.stored()) {
            tracing::error!("Failed to persist device {}: {:#}", device.id(), e);
        }
    }

    fn emit(&self, event: UiEvent) {
        // No subscribers is not an error
        let _ = self.inner.events.send(event);
    }
}

fn parse_app_id(announcement: &Announcement) -> Option<Uuid> {
    announcement
        .metadata
        .get(ABOUT_APP_ID)
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use shared::types::ObjectDescription;
    use crate::bus::testing::FakeTransport;
    use crate::registry::db::StoredDevice;

    pub fn announcement(service_name: &str, id: Uuid, name: &str) -> Announcement {
        Announcement {
            service_name: service_name.to_string(),
            port: 25,
            objects: vec![
                ObjectDescription {
                    path: "/About".to_string(),
                    interfaces: vec!["org.alljoyn.About".to_string()],
                },
                ObjectDescription {
                    path: "/About/DeviceIcon".to_string(),
                    interfaces: vec!["org.alljoyn.Icon".to_string()],
                },
            ],
            metadata: HashMap::from([
                (ABOUT_APP_ID.to_string(), id.to_string()),
                (ABOUT_DEVICE_NAME.to_string(), name.to_string()),
                (ABOUT_DEFAULT_LANGUAGE.to_string(), "en".to_string()),
            ]),
        }
    }

    fn registry_with(store: DeviceStore) -> (DeviceRegistry, Arc<FakeTransport>, broadcast::Receiver<UiEvent>) {
        let transport = Arc::new(FakeTransport::default());
        let (events, rx) = broadcast::channel(64);
        let registry = DeviceRegistry::new(store, transport.clone(), events);
        (registry, transport, rx)
    }

    fn registry() -> (DeviceRegistry, Arc<FakeTransport>, broadcast::Receiver<UiEvent>) {
        registry_with(DeviceStore::open(":memory:").unwrap())
    }

    fn drain(rx: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_new_announcement_creates_available_device() {
        let (registry, _, mut rx) = registry();
        let id = Uuid::new_v4();

        let result = registry.upsert_from_announcement(&announcement(":1.10", id, "Oven"));
        assert_eq!(result, Some(id));

        let device = registry.get(id).unwrap();
        assert_eq!(device.status, DeviceStatus::Available);
        assert_eq!(device.friendly_name, "Oven");
        assert!(device.supports(Capability::Icon));
        assert!(device.about_dirty);
        assert_eq!(drain(&mut rx), vec![UiEvent::DeviceFound { id }]);
    }

    #[test]
    fn test_missing_app_id_is_dropped() {
        let (registry, _, mut rx) = registry();
        let mut ann = announcement(":1.10", Uuid::new_v4(), "Oven");
        ann.metadata.remove(ABOUT_APP_ID);

        assert_eq!(registry.upsert_from_announcement(&ann), None);

        ann.metadata.insert(ABOUT_APP_ID.to_string(), "not-a-uuid".to_string());
        assert_eq!(registry.upsert_from_announcement(&ann), None);

        assert!(registry.devices().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_reannouncement_preserves_identity_and_icon_url() {
        let (registry, transport, _rx) = registry();
        let id = Uuid::new_v4();

        registry.upsert_from_announcement(&announcement(":1.10", id, "Oven"));
        assert!(registry.set_stored_icon_url(id, "http://x/icon.png"));
        registry.set_tag(id, "muted", "true");

        registry.upsert_from_announcement(&announcement(":1.42", id, "Kitchen Oven"));

        let device = registry.get(id).unwrap();
        assert_eq!(device.id(), id);
        assert_eq!(device.service_name, ":1.42");
        assert_eq!(device.friendly_name, "Kitchen Oven");
        assert_eq!(device.stored_icon_url.as_deref(), Some("http://x/icon.png"));
        assert_eq!(registry.tag(id, "muted").as_deref(), Some("true"));
        assert_eq!(registry.devices().len(), 1);
        assert_eq!(*transport.detached.lock(), vec![":1.10".to_string()]);
    }

    #[test]
    fn test_unverified_loss_keeps_device() {
        let (registry, _, mut rx) = registry();
        let id = Uuid::new_v4();
        registry.upsert_from_announcement(&announcement(":1.10", id, "Oven"));
        drain(&mut rx);

        assert_eq!(registry.mark_lost(":1.10", false), None);
        assert!(registry.contains(id));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_verified_loss_removes_only_bound_device() {
        let (registry, _, mut rx) = registry();
        let oven = Uuid::new_v4();
        let fridge = Uuid::new_v4();
        registry.upsert_from_announcement(&announcement(":1.10", oven, "Oven"));
        registry.upsert_from_announcement(&announcement(":1.11", fridge, "Fridge"));
        drain(&mut rx);

        assert_eq!(registry.mark_lost(":1.10", true), Some(oven));
        assert!(!registry.contains(oven));
        assert!(registry.contains(fridge));
        assert_eq!(drain(&mut rx), vec![UiEvent::DeviceLost { id: oven }]);

        assert_eq!(registry.mark_lost(":1.99", true), None);
        assert!(registry.contains(fridge));
    }

    #[test]
    fn test_loss_uses_current_service_name() {
        let (registry, _, _rx) = registry();
        let id = Uuid::new_v4();
        registry.upsert_from_announcement(&announcement(":1.10", id, "Oven"));
        registry.upsert_from_announcement(&announcement(":1.20", id, "Oven"));

        assert_eq!(registry.mark_lost(":1.10", true), None);
        assert_eq!(registry.by_service_name(":1.20").map(|d| d.id()), Some(id));
        assert!(registry.by_service_name(":1.10").is_none());
        assert_eq!(registry.mark_lost(":1.20", true), Some(id));
    }

    #[test]
    fn test_load_creates_placeholders_upgraded_by_announcement() {
        let store = DeviceStore::open(":memory:").unwrap();
        let id = Uuid::new_v4();
        store.save(&StoredDevice {
            id,
            friendly_name: "Old Oven".to_string(),
            stored_icon_url: Some("http://x/icon.png".to_string()),
        }).unwrap();

        let (registry, _, mut rx) = registry_with(store);
        assert_eq!(registry.load().unwrap(), 1);

        let device = registry.get(id).unwrap();
        assert_eq!(device.status, DeviceStatus::Unavailable);
        assert_eq!(device.friendly_name, "Old Oven");

        registry.upsert_from_announcement(&announcement(":1.5", id, "Oven"));
        let device = registry.get(id).unwrap();
        assert_eq!(device.status, DeviceStatus::Available);
        assert_eq!(device.friendly_name, "Oven");
        assert_eq!(device.stored_icon_url.as_deref(), Some("http://x/icon.png"));
        assert_eq!(
            drain(&mut rx),
            vec![UiEvent::DeviceStatusChanged { id }, UiEvent::DeviceFound { id }]
        );
    }

    #[test]
    fn test_empty_service_name_matches_no_placeholder() {
        let store = DeviceStore::open(":memory:").unwrap();
        let id = Uuid::new_v4();
        store.save(&StoredDevice {
            id,
            friendly_name: "Old Oven".to_string(),
            stored_icon_url: None,
        }).unwrap();

        let (registry, transport, mut rx) = registry_with(store);
        registry.load().unwrap();
        drain(&mut rx);

        assert!(registry.by_service_name("").is_none());
        assert_eq!(registry.mark_lost("", true), None);
        assert!(registry.contains(id));
        assert!(drain(&mut rx).is_empty());
        assert!(transport.detached.lock().is_empty());
    }

    #[test]
    fn test_changes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.db");
        let id = Uuid::new_v4();

        {
            let (registry, _, _rx) = registry_with(DeviceStore::open(&path).unwrap());
            registry.upsert_from_announcement(&announcement(":1.10", id, "Oven"));
            registry.set_stored_icon_url(id, "http://x/icon.png");
        }

        let (registry, _, _rx) = registry_with(DeviceStore::open(&path).unwrap());
        registry.load().unwrap();
        let device = registry.get(id).unwrap();
        assert_eq!(device.friendly_name, "Oven");
        assert_eq!(device.stored_icon_url.as_deref(), Some("http://x/icon.png"));
    }

    #[test]
    fn test_read_about_clears_dirty_flag() {
        let (registry, _, _rx) = registry();
        let id = Uuid::new_v4();
        registry.upsert_from_announcement(&announcement(":1.10", id, "Oven"));

        let about = registry.read_about(id).unwrap();
        assert_eq!(about.get(ABOUT_DEVICE_NAME).map(String::as_str), Some("Oven"));
        assert!(!registry.get(id).unwrap().about_dirty);

        registry.upsert_from_announcement(&announcement(":1.10", id, "Oven"));
        assert!(registry.get(id).unwrap().about_dirty);
        assert_eq!(registry.read_about(Uuid::new_v4()), None);
    }

    #[test]
    fn test_tags() {
        let (registry, _, _rx) = registry();
        let id = Uuid::new_v4();
        registry.upsert_from_announcement(&announcement(":1.10", id, "Oven"));

        registry.set_tag(id, "last_action", "get_icon_url");
        assert_eq!(registry.tag(id, "last_action").as_deref(), Some("get_icon_url"));

        registry.remove_tag(id, "last_action");
        assert_eq!(registry.tag(id, "last_action"), None);
    }
}
