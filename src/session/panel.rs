use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::location::PositionSample;
use crate::movement::MovementState;
use crate::util;

pub const NOT_AVAILABLE: &str = "N/A";
pub const NEVER_SENT: &str = "—";

/// User-facing notice raised when a start attempt is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

/// What the status card shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPanel {
    pub tracking: bool,
    pub plate: Option<String>,
    pub movement: MovementState,
    pub position: Option<PositionSample>,
    pub last_report_at: Option<DateTime<Local>>,
    pub alert: Option<Alert>,
}

impl StatusPanel {
    /// `lat, lon` with six decimals, once a position was received.
    pub fn coordinates_text(&self) -> Option<String> {
        self.position
            .as_ref()
            .map(|p| format!("{:.6}, {:.6}", p.latitude, p.longitude))
    }

    /// Rounded accuracy in meters, once a position was received.
    pub fn accuracy_text(&self) -> Option<String> {
        self.position.as_ref().map(|p| match p.accuracy {
            Some(accuracy) if accuracy > 0.0 => format!("{} m", accuracy.round()),
            _ => NOT_AVAILABLE.to_string(),
        })
    }

    pub fn last_report_text(&self) -> String {
        self.last_report_at
            .as_ref()
            .map(util::format_hms)
            .unwrap_or_else(|| NEVER_SENT.to_string())
    }
}

/// The presentation layer as seen by the tracker.
pub trait Presenter: Send + Sync {
    fn alert(&self, alert: &Alert);
    fn render(&self, panel: &StatusPanel);
}

/// Publishes every rendered panel on a watch channel and logs alerts.
pub struct PanelPresenter {
    tx: watch::Sender<StatusPanel>,
}

impl PanelPresenter {
    pub fn new() -> (Self, watch::Receiver<StatusPanel>) {
        let (tx, rx) = watch::channel(StatusPanel::default());
        (Self { tx }, rx)
    }
}

impl Presenter for PanelPresenter {
    fn alert(&self, alert: &Alert) {
        warn!("{}: {}", alert.title, alert.message);
    }

    fn render(&self, panel: &StatusPanel) {
        if let (Some(plate), Some(coordinates)) = (&panel.plate, panel.coordinates_text()) {
            info!(
                "{} {} at {} (last report {})",
                plate,
                panel.movement,
                coordinates,
                panel.last_report_text()
            );
        }
        self.tx.send_replace(panel.clone());
    }
}
