pub mod gpsd;
pub mod replay;

pub use gpsd::GpsdProvider;
pub use replay::ReplayProvider;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::{LocationConfig, LocationSource};
use crate::geo;

const SUBSCRIPTION_BUFFER: usize = 32;

/// One reading from the location service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Instantaneous speed in m/s, when the receiver reports one.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Horizontal accuracy in meters.
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            speed: None,
            accuracy: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_speed(mut self, speed: Option<f64>) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_accuracy(mut self, accuracy: Option<f64>) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn coordinates(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// How often a subscription forwards samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub time_interval: Duration,
    pub distance_interval_m: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            time_interval: Duration::from_millis(5000),
            distance_interval_m: 5.0,
        }
    }
}

impl From<&LocationConfig> for WatchOptions {
    fn from(config: &LocationConfig) -> Self {
        Self {
            time_interval: Duration::from_millis(config.time_interval_ms),
            distance_interval_m: config.distance_interval_m,
        }
    }
}

/// A device location service.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Asks for access to the location service.
    async fn request_permission(&self) -> Result<PermissionStatus>;

    /// Opens a continuous stream of position samples.
    async fn watch_position(&self, options: WatchOptions) -> Result<Subscription>;
}

pub fn provider_from_config(config: &LocationConfig) -> Box<dyn LocationProvider> {
    match config.source {
        LocationSource::Gpsd => Box::new(GpsdProvider::new(
            config.gpsd.host.clone(),
            config.gpsd.port,
            Duration::from_millis(config.gpsd.probe_timeout_ms),
        )),
        LocationSource::Replay => Box::new(ReplayProvider::new(
            config.replay.path.clone(),
            Duration::from_millis(config.replay.pace_ms),
        )),
    }
}

/// Live handle on a position stream. Removing or dropping it stops the
/// producer.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<PositionSample>,
    producer: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<PositionSample>, producer: JoinHandle<()>) -> Self {
        Self {
            receiver,
            producer: Some(producer),
        }
    }

    /// Subscription fed by someone else holding the sender.
    pub fn from_receiver(receiver: mpsc::Receiver<PositionSample>) -> Self {
        Self {
            receiver,
            producer: None,
        }
    }

    pub async fn recv(&mut self) -> Option<PositionSample> {
        self.receiver.recv().await
    }

    pub fn remove(&mut self) {
        if let Some(producer) = self.producer.take() {
            debug!("Stopping location producer");
            producer.abort();
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Creates the channel behind a [`Subscription`]; producers push raw samples
/// into the returned sink, which applies the watch options.
pub fn channel(options: WatchOptions) -> (SampleSink, mpsc::Receiver<PositionSample>) {
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    (
        SampleSink {
            tx,
            filter: SampleFilter::new(options),
        },
        rx,
    )
}

pub struct SampleSink {
    tx: mpsc::Sender<PositionSample>,
    filter: SampleFilter,
}

impl SampleSink {
    /// Forwards the sample if the watch options let it through. Returns
    /// `false` once the subscriber is gone.
    pub async fn push(&mut self, sample: PositionSample) -> bool {
        if !self.filter.accept(&sample) {
            trace!("Sample throttled by watch options");
            return !self.tx.is_closed();
        }
        self.tx.send(sample).await.is_ok()
    }
}

/// Lets a sample through when enough time has passed or enough ground was
/// covered since the last forwarded one.
#[derive(Debug, Clone)]
pub struct SampleFilter {
    options: WatchOptions,
    last_forwarded: Option<PositionSample>,
}

impl SampleFilter {
    pub fn new(options: WatchOptions) -> Self {
        Self {
            options,
            last_forwarded: None,
        }
    }

    pub fn accept(&mut self, sample: &PositionSample) -> bool {
        let pass = match &self.last_forwarded {
            None => true,
            Some(last) => {
                let elapsed = (sample.timestamp - last.timestamp)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                elapsed >= self.options.time_interval
                    || geo::distance_meters(last.coordinates(), sample.coordinates())
                        >= self.options.distance_interval_m
            }
        };
        if pass {
            self.last_forwarded = Some(sample.clone());
        }
        pass
    }
}
