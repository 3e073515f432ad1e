use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::{LocationProvider, PermissionStatus, PositionSample, Subscription, WatchOptions};

/// Plays back position samples stored as newline-delimited JSON.
///
/// Blank lines and lines starting with `#` are skipped. Each line is a
/// [`PositionSample`]; `speed`, `accuracy` and `timestamp` may be omitted.
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    path: PathBuf,
    pace: Duration,
}

impl ReplayProvider {
    pub fn new(path: PathBuf, pace: Duration) -> Self {
        Self { path, pace }
    }
}

#[async_trait]
impl LocationProvider for ReplayProvider {
    async fn request_permission(&self) -> Result<PermissionStatus> {
        match fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => Ok(PermissionStatus::Granted),
            Ok(_) => {
                warn!("Replay source {:?} is not a file", self.path);
                Ok(PermissionStatus::Denied)
            }
            Err(e) => {
                warn!("Replay source {:?} is not readable: {}", self.path, e);
                Ok(PermissionStatus::Denied)
            }
        }
    }

    async fn watch_position(&self, options: WatchOptions) -> Result<Subscription> {
        let file = fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open replay file {:?}", self.path))?;
        info!("Replaying positions from {:?}", self.path);

        let pace = self.pace;
        let path = self.path.clone();
        let (mut sink, receiver) = super::channel(options);
        let producer = tokio::spawn(async move {
            let mut lines = BufReader::new(file).lines();
            let mut line_no = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                line_no += 1;
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let sample: PositionSample = match serde_json::from_str(line) {
                    Ok(sample) => sample,
                    Err(e) => {
                        warn!("Skipping {:?} line {}: {}", path, line_no, e);
                        continue;
                    }
                };
                if !sink.push(sample).await {
                    return;
                }
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
            }
            info!("Replay of {:?} finished", path);
        });

        Ok(Subscription::new(receiver, producer))
    }
}
