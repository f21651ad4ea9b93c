//! commentcap: collects the comments a page loads while you browse it.
//!
//! The browser is driven over its DevTools protocol. Each tab on the tracked
//! site gets a capture session whose buffer fills from intercepted comment
//! list responses; the buffer is served to the UI over HTTP and a push socket.

// Declare modules
pub mod capture;
pub mod config;
pub mod host;
pub mod web_server;

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use capture::scroll::spawn_scroll_ticker;
use capture::{CaptureOptions, CaptureService, SiteMatcher};
use config::CaptureConfig;
use host::CdpHost;

/// Connect to the browser and serve until Ctrl-C or browser disconnect
pub async fn run(config: CaptureConfig) -> Result<()> {
    let site = SiteMatcher::from_config(&config.capture).context("invalid [capture] settings")?;

    let (host, host_events) = CdpHost::connect(&config.browser.devtools_url, config.browser.command_timeout_ms)
        .await
        .with_context(|| format!("could not reach browser at {}", config.browser.devtools_url))?;
    let host = Arc::new(host);

    let handle = CaptureService::start(
        host.clone(),
        host_events,
        CaptureOptions {
            site,
            event_capacity: config.capture.event_capacity,
            scroll_by_default: config.scroll.enabled_by_default,
        },
    );

    let (ticker_running, ticker_stop) = watch::channel(true);
    let ticker = spawn_scroll_ticker(
        host,
        handle.registry().clone(),
        Duration::from_millis(config.scroll.interval_ms.max(1)),
        ticker_stop,
    );

    let listener = TcpListener::bind(&config.web.bind)
        .await
        .with_context(|| format!("failed binding UI listener on {}", config.web.bind))?;

    let stop = {
        let handle = handle.clone();
        async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Could not listen for Ctrl-C: {}", e);
                    }
                    info!("Shutting down");
                }
                _ = handle.stopped() => warn!("Browser connection lost"),
            }
        }
    };

    web_server::serve(listener, handle.clone(), stop)
        .await
        .context("UI server failed")?;

    let _ = ticker_running.send(false);
    let _ = ticker.await;
    handle.shutdown().await;
    Ok(())
}
