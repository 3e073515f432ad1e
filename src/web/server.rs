use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::index_page;
use crate::config::WebConfig;
use crate::session::TrackerHandle;

pub struct WebServer {
    handle: TrackerHandle,
    host: String,
    port: u16,
}

impl WebServer {
    pub fn new(handle: TrackerHandle, config: &WebConfig) -> Self {
        Self {
            handle,
            host: config.host.clone(),
            port: config.port,
        }
    }

    pub fn router(&self) -> Router {
        index_page::routes(self.handle.clone()).layer(TraceLayer::new_for_http())
    }

    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let app = self.router();

        let address = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind to {}", address))?;
        info!("Starting web console on http://{}", address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("Shutting down web console...");
            })
            .await
            .context("Failed to serve")?;
        Ok(())
    }
}
