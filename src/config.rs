use anyhow::{Context, Result};
use config::{Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::movement::{DEFAULT_DISTANCE_THRESHOLD_M, DEFAULT_SPEED_THRESHOLD_MS};

pub const DEFAULT_WEBHOOK_URL: &str =
    "https://pinier-unshorn-arlena.ngrok-free.dev/webhook/rastreion8n";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub log_level: String,
    #[serde(default)]
    pub vehicle: VehicleConfig,
    pub location: LocationConfig,
    pub movement: MovementConfig,
    pub report: ReportConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VehicleConfig {
    /// Start tracking this plate as soon as the daemon is up.
    pub plate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    Gpsd,
    Replay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub source: LocationSource,
    pub time_interval_ms: u64,
    pub distance_interval_m: f64,
    pub gpsd: GpsdConfig,
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpsdConfig {
    pub host: String,
    pub port: u16,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    pub path: PathBuf,
    pub pace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MovementConfig {
    pub speed_threshold_ms: f64,
    pub distance_threshold_m: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    pub webhook_url: String,
    /// Minimum time between two reports, in milliseconds.
    pub min_interval_ms: u64,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Loads the file named by `RASTREIO_CONFIG`, or else the one
    /// [`Config::locate`] finds under `config/`, `/etc/rastreio/` and the
    /// user config directory. `RASTREIO_*` variables override either.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("RASTREIO_CONFIG") {
            return Self::from_file(Some(Path::new(&path)));
        }

        let mut search_dirs = vec![PathBuf::from("config"), PathBuf::from("/etc/rastreio")];
        if let Some(dir) = dirs::config_dir() {
            search_dirs.push(dir.join("rastreio"));
        }

        let env = std::env::var("RUST_ENV").ok();
        let path = Self::locate(env.as_deref(), &search_dirs);
        debug!("Configuration file: {:?}", path);
        Self::from_file(path.as_deref())
    }

    /// First `{env}.toml` found in `search_dirs`. Without an env, a
    /// `dev.toml` wins over the installed `prod.toml`.
    pub fn locate(env: Option<&str>, search_dirs: &[PathBuf]) -> Option<PathBuf> {
        let names = match env {
            Some(env) => vec![format!("{}.toml", env)],
            None => vec!["dev.toml".to_string(), "prod.toml".to_string()],
        };
        names
            .iter()
            .flat_map(|name| search_dirs.iter().map(move |dir| dir.join(name)))
            .find(|path| path.is_file())
    }

    /// Defaults, then the given file (if any), then the environment.
    pub fn from_file(path: Option<&Path>) -> Result<Self> {
        let mut builder = Self::defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("RASTREIO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let builder = config::Config::builder()
            .set_default("log_level", "info")?
            .set_default("location.source", "gpsd")?
            .set_default("location.time_interval_ms", 5000)?
            .set_default("location.distance_interval_m", 5.0)?
            .set_default("location.gpsd.host", "127.0.0.1")?
            .set_default("location.gpsd.port", 2947)?
            .set_default("location.gpsd.probe_timeout_ms", 2000)?
            .set_default("location.replay.path", "demos/route.jsonl")?
            .set_default("location.replay.pace_ms", 1000)?
            .set_default("movement.speed_threshold_ms", DEFAULT_SPEED_THRESHOLD_MS)?
            .set_default("movement.distance_threshold_m", DEFAULT_DISTANCE_THRESHOLD_M)?
            .set_default("report.webhook_url", DEFAULT_WEBHOOK_URL)?
            .set_default("report.min_interval_ms", 5000)?
            .set_default("web.enabled", true)?
            .set_default("web.host", "0.0.0.0")?
            .set_default("web.port", 3000)?;
        Ok(builder)
    }
}
