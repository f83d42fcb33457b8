/// mDNS service type carrying About announcements
pub const ABOUT_SERVICE_TYPE: &str = "_alljoyn-about._tcp.local.";

/// TXT record key holding the announced object descriptions
pub const TXT_OBJECTS: &str = "objects";

/// About metadata keys carried in an announcement
pub const ABOUT_APP_ID: &str = "AppId";
pub const ABOUT_DEVICE_NAME: &str = "DeviceName";
pub const ABOUT_DEFAULT_LANGUAGE: &str = "DefaultLanguage";
pub const ABOUT_SUPPORT_URL: &str = "SupportUrl";

/// Interface name prefixes used to test service support
pub const ABOUT_INTERFACE: &str = "org.alljoyn.About";
pub const ICON_INTERFACE: &str = "org.alljoyn.Icon";
pub const NOTIFICATION_INTERFACE: &str = "org.alljoyn.Notification";

/// Stored icon URL meaning "the device has no icon, draw the default"
pub const ICON_DEFAULT_URL: &str = "local://defaultURL";

/// Prefix of synthetic URLs for icons fetched as raw content from a device
pub const ICON_LOCAL_PREFIX_URL: &str = "local://DeviceContent/";

/// View id sentinel: the request is for the notification banner icon
pub const IGNORE_VIEW_ID: i32 = -1;

/// HTTP paths of the icon interface exposed by announced peers
pub const ICON_URL_PATH: &str = "/about/icon/url";
pub const ICON_SIZE_PATH: &str = "/about/icon/size";
pub const ICON_CONTENT_PATH: &str = "/about/icon/content";
pub const ICON_MIME_TYPE_PATH: &str = "/about/icon/mimetype";

