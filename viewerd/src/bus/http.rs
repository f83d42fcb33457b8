use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use shared::protocol::{ICON_CONTENT_PATH, ICON_MIME_TYPE_PATH, ICON_SIZE_PATH, ICON_URL_PATH};
use super::{BusError, IconTransport, Peer};

/// Icon interface spoken over HTTP to peers found by the browser.
///
/// A session maps a service name to the address it was resolved at. The
/// browser attaches sessions as peers resolve; the registry detaches them
/// when a name goes stale.
pub struct HttpIconTransport {
    client: reqwest::Client,
    runtime: Handle,
    sessions: RwLock<HashMap<String, IpAddr>>,
}

impl HttpIconTransport {
    pub fn new(runtime: Handle, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create bus HTTP client")?;

        Ok(Self {
            client,
            runtime,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn attach(&self, service_name: &str, addr: IpAddr) {
        let previous = self.sessions.write().insert(service_name.to_string(), addr);
        if previous != Some(addr) {
            tracing::debug!("Session for {} at {}", service_name, addr);
        }
    }

    fn endpoint(&self, peer: &Peer, path: &str) -> Result<String, BusError> {
        if peer.service_name.is_empty() {
            return Err(BusError::NoPeerName(peer.service_name.clone()));
        }
        let ip = self
            .sessions
            .read()
            .get(&peer.service_name)
            .copied()
            .ok_or_else(|| BusError::CantEstablishSession(peer.service_name.clone()))?;

        Ok(format!("http://{}{}", SocketAddr::new(ip, peer.port), path))
    }

    fn get_bytes(&self, peer: &Peer, path: &str) -> Result<Vec<u8>, BusError> {
        let url = self.endpoint(peer, path)?;

        self.runtime.block_on(async {
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(BusError::Status(status.as_u16()));
            }
            Ok(response.bytes().await?.to_vec())
        })
    }

    fn get_text(&self, peer: &Peer, path: &str) -> Result<String, BusError> {
        let body = self.get_bytes(peer, path)?;
        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }
}

impl IconTransport for HttpIconTransport {
    fn icon_url(&self, peer: &Peer) -> Result<String, BusError> {
        self.get_text(peer, ICON_URL_PATH)
    }

    fn icon_size(&self, peer: &Peer) -> Result<u32, BusError> {
        let text = self.get_text(peer, ICON_SIZE_PATH)?;
        text.parse()
            .map_err(|_| BusError::InvalidResponse(format!("icon size {:?}", text)))
    }

    fn icon_content(&self, peer: &Peer) -> Result<Vec<u8>, BusError> {
        self.get_bytes(peer, ICON_CONTENT_PATH)
    }

    fn icon_mime_type(&self, peer: &Peer) -> Result<String, BusError> {
        self.get_text(peer, ICON_MIME_TYPE_PATH)
    }

    fn detach(&self, service_name: &str) {
        if self.sessions.write().remove(service_name).is_some() {
            tracing::debug!("Dropped session for {}", service_name);
        }
    }
}
