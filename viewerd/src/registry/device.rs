use std::collections::{HashMap, HashSet};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use shared::protocol::{ABOUT_INTERFACE, ICON_INTERFACE, NOTIFICATION_INTERFACE};
use shared::types::{DeviceStatus, DeviceView, ObjectDescription};
use crate::bus::Peer;
use crate::registry::db::StoredDevice;

/// A remote service a device may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    About,
    Icon,
    Notification,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::About, Capability::Icon, Capability::Notification];

    pub fn interface(self) -> &'static str {
        match self {
            Capability::About => ABOUT_INTERFACE,
            Capability::Icon => ICON_INTERFACE,
            Capability::Notification => NOTIFICATION_INTERFACE,
        }
    }

    /// Compute the capability set of a device from its announced objects.
    /// An interface matches a capability when it starts with the capability's
    /// interface name, so versioned names ("org.alljoyn.Icon.v2") count.
    pub fn from_objects(objects: &[ObjectDescription]) -> HashSet<Capability> {
        Self::ALL
            .into_iter()
            .filter(|cap| {
                objects
                    .iter()
                    .flat_map(|obj| obj.interfaces.iter())
                    .any(|iface| iface.starts_with(cap.interface()))
            })
            .collect()
    }
}

/// A known peer device. Owned by the registry.
#[derive(Debug, Clone)]
pub struct Device {
    id: Uuid,
    /// Transient bus address, rebound on every announcement
    pub service_name: String,
    pub port: u16,
    pub friendly_name: String,
    pub status: DeviceStatus,
    /// `None` until the icon has been resolved
    pub stored_icon_url: Option<String>,
    pub default_language: String,
    pub help_url: String,
    pub about: HashMap<String, String>,
    pub about_dirty: bool,
    pub objects: Vec<ObjectDescription>,
    pub capabilities: HashSet<Capability>,
    /// UI bookkeeping
    pub tags: HashMap<String, String>,
    pub last_announced: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: Uuid, service_name: String) -> Self {
        Self {
            id,
            service_name,
            port: 0,
            friendly_name: String::new(),
            status: DeviceStatus::Available,
            stored_icon_url: None,
            default_language: "en".to_string(),
            help_url: String::new(),
            about: HashMap::new(),
            about_dirty: true,
            objects: Vec::new(),
            capabilities: HashSet::new(),
            tags: HashMap::new(),
            last_announced: None,
        }
    }

    /// A device known only from persisted state, waiting for an announcement
    pub fn placeholder(stored: StoredDevice) -> Self {
        let mut device = Self::new(stored.id, String::new());
        device.friendly_name = stored.friendly_name;
        device.stored_icon_url = stored.stored_icon_url;
        device.status = DeviceStatus::Unavailable;
        device
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn peer(&self) -> Peer {
        Peer {
            service_name: self.service_name.clone(),
            port: self.port,
        }
    }

    pub fn stored(&self) -> StoredDevice {
        StoredDevice {
            id: self.id,
            friendly_name: self.friendly_name.clone(),
            stored_icon_url: self.stored_icon_url.clone(),
        }
    }

    pub fn view(&self) -> DeviceView {
        let mut capabilities: Vec<String> = self
            .capabilities
            .iter()
            .map(|cap| cap.interface().to_string())
            .collect();
        capabilities.sort();

        DeviceView {
            id: self.id,
            service_name: self.service_name.clone(),
            friendly_name: self.friendly_name.clone(),
            status: self.status,
            stored_icon_url: self.stored_icon_url.clone(),
            default_language: self.default_language.clone(),
            help_url: self.help_url.clone(),
            capabilities,
            objects: self.objects.clone(),
            about_dirty: self.about_dirty,
            tags: self.tags.clone(),
            last_announced: self.last_announced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(path: &str, interfaces: &[&str]) -> ObjectDescription {
        ObjectDescription {
            path: path.to_string(),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_capabilities_by_interface_prefix() {
        let objects = vec![
            object("/About", &["org.alljoyn.About"]),
            object("/About/DeviceIcon", &["org.alljoyn.Icon"]),
        ];

        let caps = Capability::from_objects(&objects);
        assert!(caps.contains(&Capability::About));
        assert!(caps.contains(&Capability::Icon));
        assert!(!caps.contains(&Capability::Notification));
    }

    #[test]
    fn test_empty_objects_have_no_capabilities() {
        let objects = vec![object("/About", &[])];
        assert!(Capability::from_objects(&objects).is_empty());
        assert!(Capability::from_objects(&[]).is_empty());
    }

    #[test]
    fn test_placeholder_is_unavailable() {
        let stored = StoredDevice {
            id: Uuid::new_v4(),
            friendly_name: "Toaster".to_string(),
            stored_icon_url: Some("http://x/t.png".to_string()),
        };

        let device = Device::placeholder(stored.clone());
        assert_eq!(device.id(), stored.id);
        assert_eq!(device.status, DeviceStatus::Unavailable);
        assert_eq!(device.stored(), stored);
        assert!(device.service_name.is_empty());
    }
}
