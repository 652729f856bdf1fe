//! Trait-Definitionen und gemeinsame Typen für das Mapping von Sensor-Samples.

use crate::device::DeviceCommand;
use crate::mapping::{Direction, MappingError, SensorSample};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Enum für die verschiedenen Typen von Mapping-Strategien
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingType {
    /// Digitale Lenkung über gedrückte Pfeiltasten
    DiscreteKeys,

    /// Analoge Lenkung über Achsen eines virtuellen Controllers
    #[default]
    ContinuousAxis,
}

impl Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingType::DiscreteKeys => write!(f, "discrete-keys"),
            MappingType::ContinuousAxis => write!(f, "continuous-axis"),
        }
    }
}

impl FromStr for MappingType {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "discrete-keys" => Ok(MappingType::DiscreteKeys),
            "continuous-axis" => Ok(MappingType::ContinuousAxis),
            other => Err(MappingError::UnknownMappingType(other.to_string())),
        }
    }
}

/// Zustand einer Session, so wie er zuletzt an das Gerät übergeben wurde
///
/// Achsenwerte sind `None`, solange die Session noch keine Achse geschrieben
/// hat (und im Tastaturmodus immer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SteeringState {
    pub steering_axis: Option<i32>,
    pub gas_axis: Option<i32>,
    pub brake_axis: Option<i32>,

    pub left_key_down: bool,
    pub right_key_down: bool,
    pub gas_key_down: bool,
    pub brake_key_down: bool,

    /// Zeitpunkt des letzten übernommenen Updates
    pub last_update: Option<Instant>,
}

impl SteeringState {
    /// `true`, wenn keine Taste mehr als gedrückt gilt
    pub fn no_keys_held(&self) -> bool {
        !(self.left_key_down || self.right_key_down || self.gas_key_down || self.brake_key_down)
    }
}

/// Ergebnis einer Übersetzung: Befehle plus der Zustand nach deren Anwendung
///
/// `next` darf erst übernommen werden, wenn das Gerät alle `commands`
/// angenommen hat.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub commands: Vec<DeviceCommand>,
    pub next: SteeringState,
    pub direction: Direction,
}

/// Trait für Mapping-Konfigurationen
///
/// Dieses Trait definiert die Schnittstelle für Konfigurationen, die von Mapping-Strategien
/// verwendet werden. Es ermöglicht die Validierung und Erstellung von Strategien.
pub trait MappingConfig: Send + Sync + 'static {
    /// Validiert die Konfiguration
    fn validate(&self) -> Result<(), MappingError>;

    /// Erstellt eine Strategie aus dieser Konfiguration
    fn create_strategy(&self) -> Result<Box<dyn MappingStrategy>, MappingError>;

    /// Gibt den Typ der Mapping-Strategie zurück
    fn get_type(&self) -> MappingType;

    /// Gibt den Namen der Konfiguration zurück
    fn get_name(&self) -> String {
        format!("{} mapping", self.get_type())
    }
}

/// Trait für Mapping-Strategien
///
/// Eine Strategie ist zustandslos: der Sitzungszustand wird bei jedem Aufruf
/// hereingereicht und der Folgezustand zurückgegeben.
pub trait MappingStrategy: Send + Sync + 'static {
    /// Übersetzt ein Sample ausgehend vom zuletzt übernommenen Zustand
    fn map(&self, sample: &SensorSample, state: &SteeringState) -> Translation;

    /// Befehle, die das Gerät aus `state` in die Ruhelage bringen
    fn neutral(&self, state: &SteeringState) -> Translation;

    /// Zustand einer frisch verbundenen Session
    fn initial_state(&self) -> SteeringState {
        SteeringState::default()
    }

    /// Alle Befehle, die diese Strategie jemals erzeugen kann
    ///
    /// Wird beim Start gegen die Fähigkeiten des Geräts geprüft.
    fn required_commands(&self) -> Vec<DeviceCommand>;

    /// Gibt die gewünschte Rate-Limiting-Konfiguration zurück
    fn get_rate_limit(&self) -> Option<Duration> {
        None // Standardimplementierung: kein Rate Limiting
    }

    /// Gibt den Typ der Mapping-Strategie zurück
    fn get_type(&self) -> MappingType;
}
