mod api;
mod bus;
mod config;
mod context;
mod coordinator;
mod downloader;
mod icon;
mod registry;
mod resolver;

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context as _, Result};
use shared::types::UiEvent;
use crate::bus::http::HttpIconTransport;
use crate::config::Config;
use crate::context::Context;
use crate::coordinator::Coordinator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("notification_viewerd=info"))
        )
        .init();

    tracing::info!("Starting notification-viewerd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/notification-viewer/viewerd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let cancel = CancellationToken::new();

    let transport = Arc::new(HttpIconTransport::new(
        tokio::runtime::Handle::current(),
        config.bus.request_timeout(),
    )?);
    let (ctx, workers) = Context::init(&config, transport.clone(), cancel.clone())?;

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.bus.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    // Bus events
    let (browser_tx, browser_rx) = mpsc::channel(256);
    let browser_cancel = cancel.clone();
    let browser_daemon = mdns_daemon.clone();
    let service_types = config.bus.service_types.clone();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = bus::browser::run_browser(browser_daemon, service_types, transport, browser_tx, browser_cancel).await {
            tracing::error!("mDNS browser error: {}", e);
        }
    });

    let coord_cancel = cancel.clone();
    let coordinator = Coordinator::new(ctx.registry.clone(), ctx.resolver.clone());
    let coord_handle = tokio::spawn(async move {
        if let Err(e) = coordinator::run(coordinator, browser_rx, coord_cancel).await {
            tracing::error!("Coordinator error: {}", e);
        }
    });

    let log_cancel = cancel.clone();
    let log_rx = ctx.subscribe();
    let log_handle = tokio::spawn(async move {
        log_ui_events(log_rx, log_cancel).await;
    });

    let app = api::routes::router(api::routes::AppState { ctx: ctx.clone() });

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(browser_handle, coord_handle, log_handle, server_handle);

    if let Err(e) = workers.shutdown().await {
        tracing::error!("Failed to stop workers: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Log UI events; stands in for a UI subscriber
async fn log_ui_events(mut rx: broadcast::Receiver<UiEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!("UI event: {}", json),
                    Err(e) => tracing::warn!("Failed to encode UI event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("UI event log lagged, {} events skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
}
