pub mod browser;
pub mod http;

use thiserror::Error;

/// Address of a device on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub service_name: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no session for peer {0}")]
    NoPeerName(String),
    #[error("failed to establish session with {0}")]
    CantEstablishSession(String),
    #[error("peer returned status {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// The icon interface of a remote device.
///
/// Calls block the current thread; they are made from the resolution worker,
/// never from the async runtime.
pub trait IconTransport: Send + Sync {
    fn icon_url(&self, peer: &Peer) -> Result<String, BusError>;
    fn icon_size(&self, peer: &Peer) -> Result<u32, BusError>;
    fn icon_content(&self, peer: &Peer) -> Result<Vec<u8>, BusError>;
    fn icon_mime_type(&self, peer: &Peer) -> Result<String, BusError>;

    /// Drop any session bound to a stale service name
    fn detach(&self, service_name: &str);
}
