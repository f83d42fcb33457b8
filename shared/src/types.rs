use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

/// A remote bus object and the interfaces it implements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescription {
    /// Object path, e.g. "/About/DeviceIcon"
    pub path: String,

    /// Interface names, e.g. "org.alljoyn.Icon"
    pub interfaces: Vec<String>,
}

/// A peer announcement as delivered by the bus layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    /// Transient bus address of the announcing peer
    pub service_name: String,

    /// Session port the peer listens on
    pub port: u16,

    /// Objects the peer exposes
    pub objects: Vec<ObjectDescription>,

    /// About metadata (AppId, DeviceName, DefaultLanguage, ...)
    pub metadata: HashMap<String, String>,
}

/// Loss of a peer as delivered by the bus layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLoss {
    pub service_name: String,

    /// Unverified losses are informational only
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Available,
    Unavailable,
}

/// Events broadcast to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    DeviceFound { id: Uuid },
    DeviceLost { id: Uuid },
    DeviceStatusChanged { id: Uuid },
    IconAvailable {
        app_id: Uuid,
        /// Omitted for banner icons so the UI does not patch a toast view
        #[serde(skip_serializing_if = "Option::is_none")]
        view_id: Option<i32>,
        is_notification_with_image: bool,
    },
}

/// Read-only view of a device, as served by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub id: Uuid,
    pub service_name: String,
    pub friendly_name: String,
    pub status: DeviceStatus,
    pub stored_icon_url: Option<String>,
    pub default_language: String,
    pub help_url: String,
    pub capabilities: Vec<String>,
    pub objects: Vec<ObjectDescription>,
    /// About metadata changed since it was last read
    pub about_dirty: bool,
    pub tags: HashMap<String, String>,
    pub last_announced: Option<DateTime<Utc>>,
}
