use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rastreio::config::Config;
use rastreio::location;
use rastreio::report::WebhookClient;
use rastreio::session::{PanelPresenter, Tracker, TrackerHandle, TrackerService, TrackerSettings};
use rastreio::util;
use rastreio::web::WebServer;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    util::setup_logging(&config.log_level)?;
    info!("Application starting...");

    // Create a shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel(1);

    let transport = WebhookClient::new(
        config.report.webhook_url.clone(),
        config.report.timeout_ms.map(Duration::from_millis),
    )
    .context("Failed to create webhook client")?;
    info!(
        "Reporting to {} at most every {} ms",
        transport.url(),
        config.report.min_interval_ms
    );
    let (presenter, panel) = PanelPresenter::new();
    let tracker = Tracker::new(
        location::provider_from_config(&config.location),
        Arc::new(transport),
        Box::new(presenter),
        TrackerSettings::from(&config),
    );
    let (service, handle) = TrackerService::new(tracker, panel);

    let tracker_handle = tokio::spawn(service.run(shutdown_tx.subscribe()));

    let web_handle = if config.web.enabled {
        spawn_web_server(WebServer::new(handle.clone(), &config.web), shutdown_tx.clone())
    } else {
        info!("Web console disabled in config, skipping...");
        tokio::spawn(async {})
    };

    if let Some(plate) = &config.vehicle.plate {
        auto_start(&handle, plate).await;
    }

    spawn_signal_listener(signal::ctrl_c(), shutdown_tx.clone());

    let results = tokio::join!(tracker_handle, web_handle);

    for (result, name) in [results.0, results.1]
        .into_iter()
        .zip(["Tracker service", "Web console"])
    {
        if let Err(e) = result {
            error!("{} join error: {}", name, e);
        }
    }

    info!("All services stopped, shutting down");

    Ok(())
}

async fn auto_start(handle: &TrackerHandle, plate: &str) {
    info!("Starting tracking for configured plate {}", plate.trim());
    if let Err(e) = handle.start(plate).await {
        warn!("Could not start tracking: {}", e);
    }
}

fn spawn_signal_listener<F>(
    signal: F,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                info!("Shutdown signal received, stopping services...");
                let _ = shutdown_tx.send(());
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    })
}

fn spawn_web_server(
    server: WebServer,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) = server.start(shutdown).await {
            error!("Web server error: {:#}", e);
            // A console that cannot bind takes the daemon down with it
            let _ = shutdown_tx.send(());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn test_signal_shuts_services_down() {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        spawn_signal_listener(async { Ok(()) }, shutdown_tx)
            .await
            .unwrap();
        assert!(shutdown_rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_signal_listener_keeps_running() {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        spawn_signal_listener(
            async { Err(io::Error::new(io::ErrorKind::Other, "no signal handler")) },
            shutdown_tx.clone(),
        )
        .await
        .unwrap();
        assert!(matches!(
            shutdown_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
