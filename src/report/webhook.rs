use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{ReportRecord, ReportTransport};

/// Posts reports as JSON to a fixed webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    url: String,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReportTransport for WebhookClient {
    async fn send(&self, record: &ReportRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(record)
            .send()
            .await
            .with_context(|| format!("Webhook request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Webhook answered {}: {}", status, body));
        }

        debug!("Webhook accepted report ({})", status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::PositionSample;
    use crate::movement::MovementState;
    use axum::{extract::State, http::header, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use chrono::Local;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn capture(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured.lock().unwrap().push((content_type, body));
        StatusCode::OK
    }

    async fn serve(router: Router) -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Ok(format!("http://{}", addr))
    }

    fn record() -> ReportRecord {
        let sample = PositionSample::new(-23.5505, -46.6333).with_accuracy(Some(8.0));
        ReportRecord::new("ABC1234", MovementState::Moving, &sample, Local::now())
    }

    #[tokio::test]
    async fn test_posts_json_body() -> Result<()> {
        let captured: Captured = Arc::default();
        let router = Router::new()
            .route("/webhook/rastreio", post(capture))
            .with_state(captured.clone());
        let base = serve(router).await?;

        let url = format!("{}/webhook/rastreio", base);
        let client = WebhookClient::new(url.clone(), None)?;
        assert_eq!(client.url(), url);
        client.send(&record()).await?;

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (content_type, body) = &captured[0];
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(body["status"], "ANDANDO");
        assert_eq!(body["veiculo"], "ABC1234");
        assert_eq!(body["coordenadas"]["precisao"], 8.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() -> Result<()> {
        let router = Router::new().route(
            "/webhook",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "workflow inactive") }),
        );
        let base = serve(router).await?;

        let client = WebhookClient::new(format!("{}/webhook", base), None)?;
        let err = client.send(&record()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("503"), "{}", message);
        assert!(message.contains("workflow inactive"), "{}", message);
        Ok(())
    }

    #[tokio::test]
    async fn test_transport_error() -> Result<()> {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };
        let client = WebhookClient::new(
            format!("http://127.0.0.1:{}/webhook", port),
            Some(Duration::from_secs(2)),
        )?;
        assert!(client.send(&record()).await.is_err());
        Ok(())
    }
}
