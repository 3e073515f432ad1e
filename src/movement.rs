use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

use crate::geo;
use crate::location::PositionSample;

pub const DEFAULT_SPEED_THRESHOLD_MS: f64 = 0.5;
pub const DEFAULT_DISTANCE_THRESHOLD_M: f64 = 10.0;

/// Binary movement state, serialized with the webhook's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MovementState {
    #[default]
    #[serde(rename = "PARADO")]
    Stopped,
    #[serde(rename = "ANDANDO")]
    Moving,
}

impl MovementState {
    pub fn as_wire(&self) -> &'static str {
        match self {
            MovementState::Stopped => "PARADO",
            MovementState::Moving => "ANDANDO",
        }
    }
}

impl fmt::Display for MovementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MovementState::Stopped => "STOPPED",
            MovementState::Moving => "MOVING",
        };
        f.write_str(label)
    }
}

/// Decides whether the vehicle is moving from consecutive position samples.
///
/// A usable instantaneous speed wins. Without one the classifier falls back
/// to the displacement since the previous sample, and with neither it reports
/// [`MovementState::Stopped`].
#[derive(Debug, Clone)]
pub struct MovementClassifier {
    speed_threshold_ms: f64,
    distance_threshold_m: f64,
    last_sample: Option<PositionSample>,
}

impl Default for MovementClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_THRESHOLD_MS, DEFAULT_DISTANCE_THRESHOLD_M)
    }
}

impl MovementClassifier {
    pub fn new(speed_threshold_ms: f64, distance_threshold_m: f64) -> Self {
        Self {
            speed_threshold_ms,
            distance_threshold_m,
            last_sample: None,
        }
    }

    pub fn classify(&mut self, sample: &PositionSample) -> MovementState {
        let moving = match sample.speed.filter(|v| !v.is_nan()) {
            // Strictly above the speed threshold
            Some(speed) => speed > self.speed_threshold_ms,
            None => match &self.last_sample {
                Some(prev) => {
                    let dist = geo::distance_meters(prev.coordinates(), sample.coordinates());
                    trace!("No usable speed, displacement since last sample: {:.2} m", dist);
                    dist >= self.distance_threshold_m
                }
                None => false,
            },
        };

        self.last_sample = Some(sample.clone());

        if moving {
            MovementState::Moving
        } else {
            MovementState::Stopped
        }
    }

    pub fn last_sample(&self) -> Option<&PositionSample> {
        self.last_sample.as_ref()
    }

    pub fn reset(&mut self) {
        self.last_sample = None;
    }
}
