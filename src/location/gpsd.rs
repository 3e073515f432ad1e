use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::{LocationProvider, PermissionStatus, PositionSample, Subscription, WatchOptions};

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Reads fixes from a gpsd daemon over its JSON socket protocol.
#[derive(Debug, Clone)]
pub struct GpsdProvider {
    host: String,
    port: u16,
    probe_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    speed: Option<f64>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    time: Option<String>,
}

impl GpsdProvider {
    pub fn new(host: String, port: u16, probe_timeout: Duration) -> Self {
        Self {
            host,
            port,
            probe_timeout,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Turns one gpsd JSON line into a sample. Only `TPV` reports with at least
/// a 2D fix carry a position.
pub fn parse_tpv(line: &str) -> Option<PositionSample> {
    let report: GpsdReport = match serde_json::from_str(line) {
        Ok(report) => report,
        Err(e) => {
            debug!("Ignoring unparsable gpsd line: {}", e);
            return None;
        }
    };

    if report.class != "TPV" || report.mode < 2 {
        return None;
    }

    let (lat, lon) = (report.lat?, report.lon?);
    let accuracy = report.eph.or(match (report.epx, report.epy) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    });
    let timestamp = report
        .time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(
        PositionSample::new(lat, lon)
            .with_speed(report.speed)
            .with_accuracy(accuracy)
            .with_timestamp(timestamp),
    )
}

#[async_trait]
impl LocationProvider for GpsdProvider {
    async fn request_permission(&self) -> Result<PermissionStatus> {
        let address = self.address();
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => Ok(PermissionStatus::Granted),
            Ok(Err(e)) => {
                warn!("gpsd at {} refused access: {}", address, e);
                Ok(PermissionStatus::Denied)
            }
            Err(_) => {
                warn!("gpsd at {} did not answer within {:?}", address, self.probe_timeout);
                Ok(PermissionStatus::Denied)
            }
        }
    }

    async fn watch_position(&self, options: WatchOptions) -> Result<Subscription> {
        let address = self.address();
        let mut stream = TcpStream::connect(&address)
            .await
            .with_context(|| format!("Failed to connect to gpsd at {}", address))?;
        stream
            .write_all(WATCH_COMMAND)
            .await
            .context("Failed to enable gpsd watch mode")?;
        info!("Watching gpsd at {}", address);

        let (mut sink, receiver) = super::channel(options);
        let producer = tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(sample) = parse_tpv(&line) {
                            if !sink.push(sample).await {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("gpsd closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!("Error reading from gpsd: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(receiver, producer))
    }
}
