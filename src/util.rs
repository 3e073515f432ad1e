use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const PLATE_MIN_LEN: usize = 7;

pub fn setup_logging(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .with(
            EnvFilter::from_default_env()
                .add_directive(log_level.parse()?)
                .add_directive("hyper=info".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Zero-padded `HH:MM:SS` in the timestamp's own zone.
pub fn format_hms<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    time.format("%H:%M:%S").to_string()
}

/// Trims and uppercases a plate; `None` when it is too short to be complete.
pub fn normalize_plate(plate: &str) -> Option<String> {
    let plate = plate.trim();
    if plate.chars().count() < PLATE_MIN_LEN {
        return None;
    }
    Some(plate.to_uppercase())
}
