use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{Context, Result};
use shared::protocol::TXT_OBJECTS;
use shared::types::{Announcement, DeviceLoss, ObjectDescription};
use super::http::HttpIconTransport;

pub enum BrowserEvent {
    Announced(Announcement),
    Lost(DeviceLoss),
}

type RecvResult = (usize, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of its receiver; flume receivers are Clone.
fn make_recv_future(idx: usize, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

/// Browse the announcement service types, turning resolved peers into
/// announcements and removals into verified losses.
pub async fn run_browser(
    daemon: ServiceDaemon,
    service_types: Vec<String>,
    transport: Arc<HttpIconTransport>,
    tx: mpsc::Sender<BrowserEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting mDNS browser");

    let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();
    for (idx, service_type) in service_types.iter().enumerate() {
        let receiver = daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;
        tracing::info!("Browsing {}", service_type);
        type_futures.push(make_recv_future(idx, receiver));
    }

    loop {
        tokio::select! {
            Some((idx, rx, result)) = type_futures.next() => {
                match result {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let announcement = convert_service_info(&info, &transport);
                        tracing::debug!("Announcement from {}", announcement.service_name);
                        if let Err(e) = tx.send(BrowserEvent::Announced(announcement)).await {
                            tracing::error!("Failed to send announcement: {}", e);
                        }
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        tracing::debug!("Peer removed: {}", fullname);
                        let loss = DeviceLoss { service_name: fullname, verified: true };
                        if let Err(e) = tx.send(BrowserEvent::Lost(loss)).await {
                            tracing::error!("Failed to send loss: {}", e);
                        }
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(_) => {
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Err(e) => {
                        tracing::warn!("Receiver {} disconnected: {}", idx, e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Convert a resolved peer into an announcement, attaching its session
fn convert_service_info(info: &ServiceInfo, transport: &HttpIconTransport) -> Announcement {
    let service_name = info.get_fullname().to_string();

    // Prefer IPv4 for the session; any address will do
    let mut addresses: Vec<_> = info.get_addresses().iter().copied().collect();
    addresses.sort_by_key(|addr| addr.is_ipv6());
    match addresses.first() {
        Some(addr) => transport.attach(&service_name, *addr),
        None => tracing::debug!("Peer {} resolved without an address", service_name),
    }

    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    announcement_from_txt(service_name, info.get_port(), txt)
}

/// Split TXT properties into the object list and About metadata
pub fn announcement_from_txt(service_name: String, port: u16, mut txt: HashMap<String, String>) -> Announcement {
    let objects = txt
        .remove(TXT_OBJECTS)
        .map(|raw| parse_objects(&raw))
        .unwrap_or_default();

    Announcement {
        service_name,
        port,
        objects,
        metadata: txt,
    }
}

/// Parse `path=iface,iface;path=iface` into object descriptions
pub fn parse_objects(raw: &str) -> Vec<ObjectDescription> {
    raw.split(';')
        .filter_map(|entry| {
            let (path, interfaces) = entry.split_once('=')?;
            let path = path.trim();
            if path.is_empty() {
                return None;
            }
            Some(ObjectDescription {
                path: path.to_string(),
                interfaces: interfaces
                    .split(',')
                    .map(str::trim)
                    .filter(|iface| !iface.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}
