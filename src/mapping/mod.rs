//! Modul für die Umwandlung von Sensor-Samples in Gerätebefehle.
//!
//! Dieses Modul enthält die reinen Übersetzungsstrategien, die ein eingehendes
//! `SensorSample` zusammen mit dem zuletzt übernommenen `SteeringState` in eine
//! Folge von `DeviceCommand`s umwandeln. Zeit und Gerätezugriff bleiben
//! außerhalb; die Strategien selbst haben keine Seiteneffekte.

pub mod axis;
pub mod error;
pub mod keyboard;
pub mod strategy;

// Re-exports für einfacheren Zugriff
pub use axis::{AxisConfig, AxisMap, AxisStrategy};
pub use error::MappingError;
pub use keyboard::{KeyMap, KeyboardConfig, KeyboardStrategy};
pub use strategy::{MappingConfig, MappingStrategy, MappingType, SteeringState, Translation};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Standard-Schwellwert für die Lenkrichtung
pub const DEFAULT_STEERING_THRESHOLD: f64 = 0.3;

/// Standard-Mindestabstand zwischen zwei Geräte-Updates (100 Hz)
pub const DEFAULT_MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Ein einzelner Messwert des Bewegungssensors
///
/// Fehlende Felder werden mit `0` bzw. `false` belegt.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct SensorSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub gas: bool,
    pub brake: bool,
}

impl SensorSample {
    /// Neigung für die Lenkung, nicht endliche Werte zählen als Mittelstellung
    pub fn tilt(&self) -> f64 {
        if self.y.is_finite() {
            self.y
        } else {
            0.0
        }
    }
}

/// Grobe Lenkrichtung eines Samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    #[default]
    Center,
    Right,
}

impl Direction {
    /// Ordnet eine Neigung anhand des Schwellwerts einer Richtung zu
    ///
    /// Die Grenzen selbst gehören zur Mitte.
    pub fn from_tilt(y: f64, threshold: f64) -> Self {
        if y < -threshold {
            Direction::Left
        } else if y > threshold {
            Direction::Right
        } else {
            Direction::Center
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Left => write!(f, "left"),
            Direction::Center => write!(f, "center"),
            Direction::Right => write!(f, "right"),
        }
    }
}

/// Rate-Limiter für Geräte-Updates
///
/// Hält selbst keinen Zeitpunkt; der Zeitpunkt des letzten Updates liegt im
/// `SteeringState` der Session, die aktuelle Zeit wird vom Aufrufer übergeben.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    /// Minimaler Zeitabstand zwischen zwei Updates
    min_interval: Duration,
}

impl RateLimiter {
    /// Erstellt einen neuen Rate-Limiter mit dem angegebenen Mindestintervall
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Prüft, ob ein Update zum Zeitpunkt `now` durchgelassen wird
    pub fn admits(&self, last_update: Option<Instant>, now: Instant) -> bool {
        match last_update {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        }
    }
}
