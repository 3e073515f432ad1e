pub mod webhook;

pub use webhook::WebhookClient;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::location::PositionSample;
use crate::movement::MovementState;
use crate::util;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(5000);

/// Body of one outbound movement report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub status: MovementState,
    #[serde(rename = "veiculo")]
    pub vehicle: String,
    #[serde(rename = "coordenadas")]
    pub coordinates: ReportCoordinates,
    /// Local send time, `HH:MM:SS`.
    #[serde(rename = "ultimo_envio")]
    pub sent_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCoordinates {
    pub lat: f64,
    pub long: f64,
    #[serde(rename = "precisao")]
    pub accuracy: Option<f64>,
}

impl ReportRecord {
    pub fn new(
        vehicle: &str,
        status: MovementState,
        sample: &PositionSample,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            status,
            vehicle: vehicle.to_string(),
            coordinates: ReportCoordinates {
                lat: sample.latitude,
                long: sample.longitude,
                accuracy: sample.accuracy,
            },
            sent_at: util::format_hms(&now),
        }
    }
}

/// Where movement reports go.
#[async_trait]
pub trait ReportTransport: Send + Sync {
    async fn send(&self, record: &ReportRecord) -> Result<()>;
}

/// Opens at most once per `min_interval`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last_sent: Option<DateTime<Local>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
        }
    }

    /// Returns true and records `now` when the window is open.
    pub fn try_acquire(&mut self, now: DateTime<Local>) -> bool {
        let open = match self.last_sent {
            None => true,
            // A clock stepped back past the last send must not close the
            // window until wall time catches up again
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed >= self.min_interval,
                Err(_) => true,
            },
        };
        if open {
            self.last_sent = Some(now);
        }
        open
    }

    pub fn last_sent(&self) -> Option<DateTime<Local>> {
        self.last_sent
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

/// A report handed to the transport.
#[derive(Debug)]
pub struct Dispatch {
    pub record: ReportRecord,
    pub sent_at: DateTime<Local>,
    /// The detached send task. Nothing waits on it outside of tests.
    pub handle: JoinHandle<()>,
}

/// Rate-limited, fire-and-forget movement reporter.
pub struct Reporter {
    transport: Arc<dyn ReportTransport>,
    limiter: RateLimiter,
}

impl Reporter {
    pub fn new(transport: Arc<dyn ReportTransport>, min_interval: Duration) -> Self {
        Self {
            transport,
            limiter: RateLimiter::new(min_interval),
        }
    }

    /// Sends a report if the rate-limit window is open. Must be called from
    /// within a tokio runtime.
    pub fn report(
        &mut self,
        vehicle: &str,
        status: MovementState,
        sample: &PositionSample,
        now: DateTime<Local>,
    ) -> Option<Dispatch> {
        if !self.limiter.try_acquire(now) {
            return None;
        }

        let record = ReportRecord::new(vehicle, status, sample, now);
        debug!(
            "Dispatching report for {}: {} at {}",
            record.vehicle,
            record.status.as_wire(),
            record.sent_at
        );

        let transport = Arc::clone(&self.transport);
        let body = record.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = transport.send(&body).await {
                warn!("Failed to deliver movement report: {:#}", e);
            }
        });

        Some(Dispatch {
            record,
            sent_at: now,
            handle,
        })
    }

    pub fn last_sent(&self) -> Option<DateTime<Local>> {
        self.limiter.last_sent()
    }

    pub fn reset(&mut self) {
        self.limiter.reset();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::bail;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Transport that keeps every record it is asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<ReportRecord>>,
    }

    impl RecordingTransport {
        pub fn records(&self) -> Vec<ReportRecord> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReportTransport for RecordingTransport {
        async fn send(&self, record: &ReportRecord) -> Result<()> {
            self.sent.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingTransport {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ReportTransport for FailingTransport {
        async fn send(&self, _record: &ReportRecord) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            bail!("connection reset")
        }
    }

    fn local(h: u32, m: u32, s: u32, ms: i64) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap() + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn test_limiter_window() {
        let mut limiter = RateLimiter::new(DEFAULT_MIN_INTERVAL);
        assert!(limiter.last_sent().is_none());

        assert!(limiter.try_acquire(local(10, 0, 0, 0)));
        assert!(!limiter.try_acquire(local(10, 0, 4, 999)));
        // Exactly one interval later opens again
        assert!(limiter.try_acquire(local(10, 0, 5, 0)));
        assert_eq!(limiter.last_sent(), Some(local(10, 0, 5, 0)));

        limiter.reset();
        assert!(limiter.try_acquire(local(10, 0, 6, 0)));
    }

    #[test]
    fn test_limiter_clock_stepped_back() {
        let mut limiter = RateLimiter::new(DEFAULT_MIN_INTERVAL);
        assert!(limiter.try_acquire(local(10, 0, 0, 0)));
        assert!(limiter.try_acquire(local(9, 0, 0, 0)));
        assert_eq!(limiter.last_sent(), Some(local(9, 0, 0, 0)));
    }

    #[test]
    fn test_record_wire_format() {
        let sample = PositionSample::new(-23.5505, -46.6333).with_accuracy(Some(12.5));
        let record = ReportRecord::new("ABC1234", MovementState::Moving, &sample, local(8, 5, 9, 0));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "ANDANDO",
                "veiculo": "ABC1234",
                "coordenadas": { "lat": -23.5505, "long": -46.6333, "precisao": 12.5 },
                "ultimo_envio": "08:05:09"
            })
        );

        let sample = PositionSample::new(0.0, 0.0);
        let record = ReportRecord::new("ABC1234", MovementState::Stopped, &sample, local(23, 59, 59, 0));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "PARADO");
        assert!(json["coordenadas"]["precisao"].is_null());
        assert_eq!(json["ultimo_envio"], "23:59:59");
    }

    #[tokio::test]
    async fn test_reporter_sends_once_per_window() -> Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut reporter = Reporter::new(transport.clone(), DEFAULT_MIN_INTERVAL);
        let sample = PositionSample::new(0.0, 0.0);

        let first = reporter
            .report("ABC1234", MovementState::Stopped, &sample, local(10, 0, 0, 0))
            .expect("window open");
        first.handle.await?;

        assert!(reporter
            .report("ABC1234", MovementState::Moving, &sample, local(10, 0, 2, 0))
            .is_none());
        assert_eq!(transport.records().len(), 1);

        let second = reporter
            .report("ABC1234", MovementState::Moving, &sample, local(10, 0, 5, 0))
            .expect("window reopened");
        second.handle.await?;

        let records = transport.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, MovementState::Moving);
        assert_eq!(reporter.last_sent(), Some(local(10, 0, 5, 0)));
        Ok(())
    }

    #[tokio::test]
    async fn test_reporter_failure_is_swallowed() -> Result<()> {
        let transport = Arc::new(FailingTransport::default());
        let mut reporter = Reporter::new(transport.clone(), DEFAULT_MIN_INTERVAL);
        let sample = PositionSample::new(0.0, 0.0);

        let dispatch = reporter
            .report("ABC1234", MovementState::Stopped, &sample, local(10, 0, 0, 0))
            .expect("window open");
        // The task completes normally even though delivery failed
        dispatch.handle.await?;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);

        // No retry: the window stays closed
        assert!(reporter
            .report("ABC1234", MovementState::Stopped, &sample, local(10, 0, 1, 0))
            .is_none());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
