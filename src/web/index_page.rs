use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::session::{Alert, StartError, StatusPanel, TrackerHandle};

// View Models
#[derive(Debug, Serialize)]
pub struct StatusViewModel {
    pub version: String,
    pub tracking: bool,
    pub plate: String,
    /// Wire value, `PARADO` or `ANDANDO`.
    pub status: String,
    pub movement: String,
    pub coordinates: Option<String>,
    pub accuracy: Option<String>,
    pub last_report: String,
    pub alert: Option<Alert>,
}

impl From<StatusPanel> for StatusViewModel {
    fn from(panel: StatusPanel) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            tracking: panel.tracking,
            plate: panel.plate.clone().unwrap_or_default(),
            status: panel.movement.as_wire().to_string(),
            movement: panel.movement.to_string(),
            coordinates: panel.coordinates_text(),
            accuracy: panel.accuracy_text(),
            last_report: panel.last_report_text(),
            alert: panel.alert,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub plate: String,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    alert: Alert,
}

// Template
#[derive(Template)]
#[template(path = "index.html")]
struct IndexPage {
    status: StatusViewModel,
    alert_title: String,
    alert_message: String,
    coordinates: String,
    accuracy: String,
}

impl From<StatusViewModel> for IndexPage {
    fn from(status: StatusViewModel) -> Self {
        let (alert_title, alert_message) = status
            .alert
            .clone()
            .map(|a| (a.title, a.message))
            .unwrap_or_default();
        Self {
            coordinates: status.coordinates.clone().unwrap_or_default(),
            accuracy: status.accuracy.clone().unwrap_or_default(),
            alert_title,
            alert_message,
            status,
        }
    }
}

// Routes and Handlers
pub fn routes(handle: TrackerHandle) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/tracking/start", post(start_form))
        .route("/tracking/stop", post(stop_form))
        .route("/api/status", get(status_api))
        .route("/api/tracking/start", post(start_api))
        .route("/api/tracking/stop", post(stop_api))
        .with_state(handle)
}

async fn index_page(State(handle): State<TrackerHandle>) -> Response {
    let template = IndexPage::from(StatusViewModel::from(handle.status()));
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("Failed to render index page: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn start_form(
    State(handle): State<TrackerHandle>,
    Form(request): Form<StartRequest>,
) -> Response {
    match handle.start(&request.plate).await {
        Err(StartError::Unavailable) => {
            error!("Failed to start tracking: {}", StartError::Unavailable);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                StartError::Unavailable.alert().message,
            )
                .into_response()
        }
        // Refusals land on the panel as an alert
        _ => Redirect::to("/").into_response(),
    }
}

async fn stop_form(State(handle): State<TrackerHandle>) -> Redirect {
    if let Err(e) = handle.stop().await {
        error!("Failed to stop tracking: {}", e);
    }
    Redirect::to("/")
}

async fn status_api(State(handle): State<TrackerHandle>) -> Json<StatusViewModel> {
    Json(handle.status().into())
}

async fn start_api(
    State(handle): State<TrackerHandle>,
    Json(request): Json<StartRequest>,
) -> Response {
    match handle.start(&request.plate).await {
        Ok(()) => Json(StatusViewModel::from(handle.status())).into_response(),
        Err(e) => {
            let status = match e {
                StartError::InvalidPlate => StatusCode::UNPROCESSABLE_ENTITY,
                StartError::PermissionDenied => StatusCode::FORBIDDEN,
                StartError::Subscription(_) => StatusCode::BAD_GATEWAY,
                StartError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            };
            let body = ApiError {
                error: e.to_string(),
                alert: e.alert(),
            };
            (status, Json(body)).into_response()
        }
    }
}

async fn stop_api(State(handle): State<TrackerHandle>) -> Response {
    match handle.stop().await {
        Ok(()) => Json(StatusViewModel::from(handle.status())).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::PositionSample;
    use crate::report::tests::RecordingTransport;
    use crate::session::tests::FakeProvider;
    use crate::session::{PanelPresenter, Tracker, TrackerService, TrackerSettings};
    use anyhow::Result;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    struct Console {
        base: String,
        client: reqwest::Client,
        provider: FakeProvider,
        handle: TrackerHandle,
        _shutdown: broadcast::Sender<()>,
    }

    async fn console(provider: FakeProvider) -> Result<Console> {
        let (presenter, panel) = PanelPresenter::new();
        let tracker = Tracker::new(
            Box::new(provider.clone()),
            Arc::new(RecordingTransport::default()),
            Box::new(presenter),
            TrackerSettings::default(),
        );
        let (service, handle) = TrackerService::new(tracker, panel);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(service.run(shutdown_rx));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = routes(handle.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Console {
            base: format!("http://{}", addr),
            client,
            provider,
            handle,
            _shutdown: shutdown,
        })
    }

    #[tokio::test]
    async fn test_status_before_tracking() -> Result<()> {
        let c = console(FakeProvider::granted()).await?;
        let status: Value = c
            .client
            .get(format!("{}/api/status", c.base))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(status["tracking"], false);
        assert_eq!(status["status"], "PARADO");
        assert_eq!(status["movement"], "STOPPED");
        assert_eq!(status["last_report"], "—");
        assert!(status["coordinates"].is_null());
        Ok(())
    }

    #[tokio::test]
    async fn test_api_start_and_stop() -> Result<()> {
        let c = console(FakeProvider::granted()).await?;

        let response = c
            .client
            .post(format!("{}/api/tracking/start", c.base))
            .json(&json!({ "plate": " abc1234 " }))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let status: Value = response.json().await?;
        assert_eq!(status["tracking"], true);
        assert_eq!(status["plate"], "ABC1234");

        c.provider.sender().send(PositionSample::new(-23.5, -46.6)).await?;
        let mut rx = c.handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| p.position.is_some()))
            .await??;

        let status: Value = c
            .client
            .get(format!("{}/api/status", c.base))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(status["coordinates"], "-23.500000, -46.600000");
        assert_eq!(status["accuracy"], "N/A");
        assert_ne!(status["last_report"], "—");

        let response = c
            .client
            .post(format!("{}/api/tracking/stop", c.base))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let status: Value = response.json().await?;
        assert_eq!(status["tracking"], false);
        Ok(())
    }

    #[tokio::test]
    async fn test_api_start_errors() -> Result<()> {
        let c = console(FakeProvider::granted()).await?;
        let response = c
            .client
            .post(format!("{}/api/tracking/start", c.base))
            .json(&json!({ "plate": "ABC12" }))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = response.json().await?;
        assert_eq!(body["alert"]["title"], "Invalid plate");
        assert_eq!(c.provider.subscriptions(), 0);

        let c = console(FakeProvider::denied()).await?;
        let response = c
            .client
            .post(format!("{}/api/tracking/start", c.base))
            .json(&json!({ "plate": "ABC1234" }))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        Ok(())
    }

    fn render(panel: StatusPanel) -> Result<String> {
        Ok(IndexPage::from(StatusViewModel::from(panel)).render()?)
    }

    #[test]
    fn test_idle_page_does_not_refresh() -> Result<()> {
        // Reloading would wipe a plate being typed
        let page = render(StatusPanel::default())?;
        assert!(page.contains(r#"name="plate""#));
        assert!(!page.contains("http-equiv=\"refresh\""));

        let page = render(StatusPanel {
            tracking: true,
            plate: Some("ABC1234".to_string()),
            ..StatusPanel::default()
        })?;
        assert!(!page.contains(r#"name="plate""#));
        assert!(page.contains("http-equiv=\"refresh\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_form_start_without_service() -> Result<()> {
        let c = console(FakeProvider::granted()).await?;
        c._shutdown.send(())?;
        // Wait for the service task to drop its command receiver
        for _ in 0..50 {
            if c.handle.stop().await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let response = c
            .client
            .post(format!("{}/tracking/start", c.base))
            .form(&[("plate", "ABC1234")])
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(c.provider.subscriptions(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_html_console() -> Result<()> {
        let c = console(FakeProvider::granted()).await?;

        let page = c.client.get(&c.base).send().await?.text().await?;
        assert!(page.contains("Start tracking"));
        assert!(page.contains("Last report: —"));

        let response = c
            .client
            .post(format!("{}/tracking/start", c.base))
            .form(&[("plate", "short")])
            .send()
            .await?;
        assert!(response.status().is_redirection());
        let page = c.client.get(&c.base).send().await?.text().await?;
        assert!(page.contains("Invalid plate"));

        c.client
            .post(format!("{}/tracking/start", c.base))
            .form(&[("plate", "abc1234")])
            .send()
            .await?;
        let page = c.client.get(&c.base).send().await?.text().await?;
        assert!(page.contains("Stop tracking"));
        assert!(page.contains("ABC1234"));
        assert!(!page.contains("Invalid plate"));

        c.client
            .post(format!("{}/tracking/stop", c.base))
            .send()
            .await?;
        assert!(!c.handle.status().tracking);
        Ok(())
    }
}
