pub mod panel;
pub mod service;

pub use panel::{Alert, PanelPresenter, Presenter, StatusPanel};
pub use service::{TrackerHandle, TrackerService};

use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::location::{LocationProvider, PermissionStatus, PositionSample, Subscription, WatchOptions};
use crate::movement::{MovementClassifier, MovementState};
use crate::report::{Dispatch, ReportTransport, Reporter};
use crate::util::{self, PLATE_MIN_LEN};

/// Why a tracking session did not start.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("vehicle plate must have at least {} characters", PLATE_MIN_LEN)]
    InvalidPlate,
    #[error("location permission denied")]
    PermissionDenied,
    #[error("failed to subscribe to location updates: {0:#}")]
    Subscription(anyhow::Error),
    #[error("tracker service is not running")]
    Unavailable,
}

impl StartError {
    pub fn alert(&self) -> Alert {
        match self {
            StartError::InvalidPlate => {
                Alert::new("Invalid plate", "Enter the vehicle's full plate.")
            }
            StartError::PermissionDenied => Alert::new(
                "Permission required",
                "Allow access to the location service to start tracking.",
            ),
            StartError::Subscription(e) => Alert::new(
                "Tracking unavailable",
                format!("Could not subscribe to location updates: {:#}", e),
            ),
            StartError::Unavailable => {
                Alert::new("Tracking unavailable", "The tracker is shutting down.")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub watch: WatchOptions,
    pub speed_threshold_ms: f64,
    pub distance_threshold_m: f64,
    pub min_report_interval: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            watch: WatchOptions::default(),
            speed_threshold_ms: crate::movement::DEFAULT_SPEED_THRESHOLD_MS,
            distance_threshold_m: crate::movement::DEFAULT_DISTANCE_THRESHOLD_M,
            min_report_interval: crate::report::DEFAULT_MIN_INTERVAL,
        }
    }
}

impl From<&Config> for TrackerSettings {
    fn from(config: &Config) -> Self {
        Self {
            watch: WatchOptions::from(&config.location),
            speed_threshold_ms: config.movement.speed_threshold_ms,
            distance_threshold_m: config.movement.distance_threshold_m,
            min_report_interval: Duration::from_millis(config.report.min_interval_ms),
        }
    }
}

/// Result of feeding one sample to an active session.
#[derive(Debug)]
pub struct SampleOutcome {
    pub state: MovementState,
    pub dispatch: Option<Dispatch>,
}

enum SessionState {
    Idle,
    Tracking(ActiveSession),
}

struct ActiveSession {
    id: Uuid,
    plate: String,
    subscription: Subscription,
}

/// One vehicle's tracking session: IDLE until started, TRACKING while a
/// location subscription is held.
pub struct Tracker {
    provider: Box<dyn LocationProvider>,
    presenter: Box<dyn Presenter>,
    classifier: MovementClassifier,
    reporter: Reporter,
    watch: WatchOptions,
    session: SessionState,
    panel: StatusPanel,
}

impl Tracker {
    pub fn new(
        provider: Box<dyn LocationProvider>,
        transport: Arc<dyn ReportTransport>,
        presenter: Box<dyn Presenter>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            provider,
            presenter,
            classifier: MovementClassifier::new(
                settings.speed_threshold_ms,
                settings.distance_threshold_m,
            ),
            reporter: Reporter::new(transport, settings.min_report_interval),
            watch: settings.watch,
            session: SessionState::Idle,
            panel: StatusPanel::default(),
        }
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.session, SessionState::Tracking(_))
    }

    pub fn panel(&self) -> &StatusPanel {
        &self.panel
    }

    pub async fn start(&mut self, plate: &str) -> Result<(), StartError> {
        if let SessionState::Tracking(active) = &self.session {
            debug!("Already tracking {}, ignoring start", active.plate);
            return Ok(());
        }

        let plate = match util::normalize_plate(plate) {
            Some(plate) => plate,
            None => return Err(self.refuse(StartError::InvalidPlate)),
        };

        match self.provider.request_permission().await {
            Ok(PermissionStatus::Granted) => {}
            Ok(PermissionStatus::Denied) => return Err(self.refuse(StartError::PermissionDenied)),
            Err(e) => {
                warn!("Permission request failed: {:#}", e);
                return Err(self.refuse(StartError::PermissionDenied));
            }
        }

        let subscription = match self.provider.watch_position(self.watch).await {
            Ok(subscription) => subscription,
            Err(e) => return Err(self.refuse(StartError::Subscription(e))),
        };

        self.classifier.reset();
        self.reporter.reset();

        let id = Uuid::new_v4();
        info!("Tracking {} (session {})", plate, id);
        self.panel.tracking = true;
        self.panel.plate = Some(plate.clone());
        self.panel.alert = None;
        self.session = SessionState::Tracking(ActiveSession {
            id,
            plate,
            subscription,
        });
        self.presenter.render(&self.panel);
        Ok(())
    }

    fn refuse(&mut self, error: StartError) -> StartError {
        let alert = error.alert();
        self.presenter.alert(&alert);
        self.panel.alert = Some(alert);
        self.presenter.render(&self.panel);
        error
    }

    /// Waits for the next sample of the active subscription. Never resolves
    /// while idle.
    pub async fn next_sample(&mut self) -> Option<PositionSample> {
        match &mut self.session {
            SessionState::Tracking(active) => active.subscription.recv().await,
            SessionState::Idle => std::future::pending().await,
        }
    }

    pub fn handle_sample(
        &mut self,
        sample: PositionSample,
        now: DateTime<Local>,
    ) -> Option<SampleOutcome> {
        let SessionState::Tracking(active) = &self.session else {
            debug!("Sample received while idle, ignoring");
            return None;
        };

        let state = self.classifier.classify(&sample);
        let dispatch = self.reporter.report(&active.plate, state, &sample, now);

        self.panel.movement = state;
        self.panel.position = Some(sample);
        if let Some(dispatch) = &dispatch {
            self.panel.last_report_at = Some(dispatch.sent_at);
        }
        self.presenter.render(&self.panel);

        Some(SampleOutcome { state, dispatch })
    }

    /// The location stream closed on its own.
    pub fn end_of_stream(&mut self) {
        if self.is_tracking() {
            warn!("Location stream ended, stopping tracking");
            self.stop();
        }
    }

    pub fn stop(&mut self) {
        let previous = std::mem::replace(&mut self.session, SessionState::Idle);
        if let SessionState::Tracking(mut active) = previous {
            active.subscription.remove();
            info!("Stopped tracking {} (session {})", active.plate, active.id);
            self.panel.tracking = false;
            self.presenter.render(&self.panel);
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.stop();
    }
}
