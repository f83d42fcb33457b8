use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::ABOUT_SERVICE_TYPE;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub icons: IconConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Restrict browsing to one interface; all interfaces when unset
    pub interface: Option<String>,
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    /// Timeout of one icon interface call to a peer
    #[serde(default = "default_read_timeout")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IconConfig {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Directory of icons shipped with the application
    pub resource_dir: Option<PathBuf>,
    #[serde(default = "default_display_density")]
    pub display_density: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_url_lookup_max_attempts")]
    pub url_lookup_max_attempts: u32,
    #[serde(default = "default_url_lookup_retry")]
    pub url_lookup_retry_secs: u64,
    #[serde(default = "default_content_fetch_max_attempts")]
    pub content_fetch_max_attempts: u32,
    #[serde(default = "default_content_fetch_retry")]
    pub content_fetch_retry_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloaderConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_download_max_retries")]
    pub max_retries: u32,
    /// Failures are usually persistent, so the cool-down is long
    #[serde(default = "default_download_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_service_types() -> Vec<String> {
    vec![ABOUT_SERVICE_TYPE.to_string()]
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/notification-viewer/devices.db")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/notification-viewer/icons")
}

fn default_display_density() -> f32 {
    1.0
}

fn default_queue_capacity() -> usize {
    100
}

fn default_url_lookup_max_attempts() -> u32 {
    100
}

fn default_url_lookup_retry() -> u64 {
    5
}

fn default_content_fetch_max_attempts() -> u32 {
    50
}

fn default_content_fetch_retry() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_read_timeout() -> u64 {
    5000
}

fn default_max_redirects() -> usize {
    10
}

fn default_download_max_retries() -> u32 {
    10
}

fn default_download_retry_delay() -> u64 {
    15 * 60
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            interface: None,
            service_types: default_service_types(),
            request_timeout_ms: default_read_timeout(),
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for IconConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            resource_dir: None,
            display_density: default_display_density(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            url_lookup_max_attempts: default_url_lookup_max_attempts(),
            url_lookup_retry_secs: default_url_lookup_retry(),
            content_fetch_max_attempts: default_content_fetch_max_attempts(),
            content_fetch_retry_secs: default_content_fetch_retry(),
        }
    }
}

impl ResolverConfig {
    pub fn url_lookup_retry(&self) -> Duration {
        Duration::from_secs(self.url_lookup_retry_secs)
    }

    pub fn content_fetch_retry(&self) -> Duration {
        Duration::from_secs(self.content_fetch_retry_secs)
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            max_redirects: default_max_redirects(),
            max_retries: default_download_max_retries(),
            retry_delay_secs: default_download_retry_delay(),
        }
    }
}

impl DownloaderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
